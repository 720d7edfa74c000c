//! Per-cell MAC scheduler.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::alloc::{AllocParams, SlotAllocator, SlotJob};
use crate::buffer::{parse_short_bsr, BufferError, NUM_LCG};
use crate::config::{CellLayout, ConfigError, SchedulerConfig, StrategyKind};
use crate::csi::CsiMeasurement;
use crate::fairness::ThroughputTracker;
use crate::harq::{HarqError, HarqManager, HarqOutcome};
use crate::logging::LOG_TARGET;
use crate::models::{Direction, Grant, HarqId, TimingInfo, UeId};
use crate::phy::{CapacityOracle, ProportionalCapacity, MAX_CQI};
use crate::slot::{SlotSelector, SlotTiming};
use crate::strategy::{MuMimoParams, RoundRobin, SchedulingStrategy};
use crate::{log_changes, log_checks};

use super::state::{SchedulerStats, UeState};

/// Errors from connection management and report ingestion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Harq(#[from] HarqError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("unknown UE {0}")]
    UnknownUe(UeId),
    #[error("UE {0} already connected")]
    DuplicateUe(UeId),
    #[error("invalid connection parameter: {0}")]
    InvalidConnection(String),
}

/// Parameters of a new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionParams {
    /// HARQ processes; the configured default when `None`.
    pub num_harq_processes: Option<u8>,
    pub antennas: u8,
    /// Wideband CQI assumed until the first report.
    pub initial_cqi: u8,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            num_harq_processes: None,
            antennas: 1,
            initial_cqi: 7,
        }
    }
}

/// MAC scheduler for one cell.
///
/// Driven once per slot boundary through [`MacScheduler::run_dl_scheduler`]
/// and [`MacScheduler::run_ul_scheduler`]; fed by buffer, channel and HARQ
/// feedback callbacks in between. Single-threaded; never blocks.
pub struct MacScheduler {
    config: SchedulerConfig,
    layout: CellLayout,
    params: [AllocParams; 2],

    // Components
    oracle: Box<dyn CapacityOracle>,
    strategy: Box<dyn SchedulingStrategy>,
    selector: SlotSelector,
    harq: [HarqManager; 2],

    // Per-UE state
    ues: FxHashMap<UeId, UeState>,

    rng: ChaCha8Rng,
    throughput: ThroughputTracker,
    stats: SchedulerStats,
}

impl MacScheduler {
    /// Scheduler with the default capacity oracle and the configured strategy.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let layout = config.validate()?;
        let strategy: Box<dyn SchedulingStrategy> = match layout.strategy {
            StrategyKind::RoundRobin => Box::new(RoundRobin::new(
                Self::mu_mimo_params(&config),
                config.verbosity,
            )),
        };
        Self::with_components(config, Box::new(ProportionalCapacity), strategy)
    }

    /// Scheduler with an injected capacity oracle and strategy.
    pub fn with_components(
        config: SchedulerConfig,
        oracle: Box<dyn CapacityOracle>,
        strategy: Box<dyn SchedulingStrategy>,
    ) -> Result<Self, SchedulerError> {
        let layout = config.validate()?;
        let timing = SlotTiming {
            fdd_periodicity: config.fdd_periodicity_slots,
            ul_prep_symbols: config.ul_prep_symbols,
            dl_ctrl_symbols: config.dl_ctrl_symbols,
            ul_reserved_symbols: config.ul_reserved_symbols,
            harq_feedback_min_slots: config.harq_feedback_min_slots,
        };
        let selector = SlotSelector::new(layout.duplex.clone(), timing, config.verbosity);
        let params = [
            AllocParams::new(&config, &layout, Direction::Downlink),
            AllocParams::new(&config, &layout, Direction::Uplink),
        ];
        let harq = [
            HarqManager::new(config.rv_sequence.clone()),
            HarqManager::new(config.rv_sequence.clone()),
        ];
        log_changes!(
            config.verbosity,
            "MAC scheduler: {:?}, {:?}, DL {} RBs / UL {} RBs",
            layout.duplex,
            layout.allocation_type,
            layout.dl_rbs,
            layout.ul_rbs
        );

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.random_seed),
            config,
            layout,
            params,
            oracle,
            strategy,
            selector,
            harq,
            ues: FxHashMap::default(),
            throughput: ThroughputTracker::new(),
            stats: SchedulerStats::default(),
        })
    }

    fn mu_mimo_params(config: &SchedulerConfig) -> Option<MuMimoParams> {
        config.mu_mimo_enabled.then_some(MuMimoParams {
            min_rbs: config.mu_min_rbs,
            min_cqi: config.mu_min_cqi,
            semi_orthogonality: config.mu_semi_orthogonality,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn num_connections(&self) -> usize {
        self.ues.len()
    }

    pub fn ue(&self, ue: UeId) -> Option<&UeState> {
        self.ues.get(&ue)
    }

    pub fn harq(&self, direction: Direction) -> &HarqManager {
        &self.harq[direction.index()]
    }

    // =========================================================================
    // Connection management
    // =========================================================================

    pub fn add_connection(
        &mut self,
        ue: UeId,
        params: ConnectionParams,
    ) -> Result<(), SchedulerError> {
        if self.ues.contains_key(&ue) {
            return Err(SchedulerError::DuplicateUe(ue));
        }
        let num_harq = params
            .num_harq_processes
            .unwrap_or(self.config.num_harq_processes);
        if num_harq == 0 || num_harq > 16 {
            return Err(SchedulerError::InvalidConnection(format!(
                "{} HARQ processes",
                num_harq
            )));
        }
        if params.antennas == 0 {
            return Err(SchedulerError::InvalidConnection(
                "zero antennas".to_string(),
            ));
        }
        if params.initial_cqi > MAX_CQI {
            return Err(SchedulerError::InvalidConnection(format!(
                "initial CQI {}",
                params.initial_cqi
            )));
        }

        for harq in &mut self.harq {
            harq.add_ue(ue, num_harq);
        }
        self.ues
            .insert(ue, UeState::new(ue, params.antennas, params.initial_cqi));
        self.throughput.register(ue);
        log_changes!(
            self.config.verbosity,
            "UE {} connected: {} HARQ processes, {} antennas, CQI {}",
            ue,
            num_harq,
            params.antennas,
            params.initial_cqi
        );
        Ok(())
    }

    pub fn remove_connection(&mut self, ue: UeId) -> Result<(), SchedulerError> {
        self.ues.remove(&ue).ok_or(SchedulerError::UnknownUe(ue))?;
        for harq in &mut self.harq {
            harq.remove_ue(ue);
        }
        self.throughput.remove(ue);
        log_changes!(self.config.verbosity, "UE {} released", ue);
        Ok(())
    }

    fn ue_mut(&mut self, ue: UeId) -> Result<&mut UeState, SchedulerError> {
        self.ues.get_mut(&ue).ok_or(SchedulerError::UnknownUe(ue))
    }

    // =========================================================================
    // Reports
    // =========================================================================

    /// RLC queue size of one DL logical channel.
    pub fn update_dl_buffer_status(
        &mut self,
        ue: UeId,
        lcid: u8,
        bytes: u32,
    ) -> Result<(), SchedulerError> {
        self.ue_mut(ue)?
            .buffer_mut(Direction::Downlink)
            .set(lcid, bytes);
        Ok(())
    }

    /// Pending UL bytes of one logical channel group.
    pub fn update_ul_buffer_status(
        &mut self,
        ue: UeId,
        lcg: u8,
        bytes: u32,
    ) -> Result<(), SchedulerError> {
        if lcg >= NUM_LCG {
            return Err(BufferError::LcgOutOfRange(lcg).into());
        }
        self.ue_mut(ue)?.buffer_mut(Direction::Uplink).set(lcg, bytes);
        Ok(())
    }

    /// Apply raw short BSR octets.
    pub fn process_bsr(&mut self, ue: UeId, raw: &[u8]) -> Result<(), SchedulerError> {
        let entries = parse_short_bsr(raw)?;
        let verbosity = self.config.verbosity;
        let buffer = self.ue_mut(ue)?.buffer_mut(Direction::Uplink);
        for entry in entries {
            buffer.set(entry.lcg, entry.bytes);
        }
        log_checks!(
            verbosity,
            "UE {} BSR: {} bytes pending",
            ue,
            buffer.total()
        );
        Ok(())
    }

    pub fn update_channel_quality(
        &mut self,
        direction: Direction,
        ue: UeId,
        report: CsiMeasurement,
    ) -> Result<(), SchedulerError> {
        self.ue_mut(ue)?.set_csi(direction, report);
        Ok(())
    }

    /// HARQ feedback: DL ACK/NACK from the UE or UL decoding result.
    pub fn on_rx_result(
        &mut self,
        direction: Direction,
        ue: UeId,
        pid: HarqId,
        success: bool,
    ) -> Result<HarqOutcome, SchedulerError> {
        let outcome = self.harq[direction.index()].on_ack_nack(ue, pid, success)?;
        match outcome {
            HarqOutcome::Delivered { tbs_bits } => {
                self.stats.delivered_tbs += 1;
                self.throughput.record(direction, ue, tbs_bits);
            }
            HarqOutcome::RetxPending => {
                self.stats.nacks += 1;
                log_checks!(
                    self.config.verbosity,
                    "{:?} NACK UE {} pid {}: retransmission queued",
                    direction,
                    ue,
                    pid
                );
            }
            HarqOutcome::Abandoned { tbs_bits } => {
                self.stats.nacks += 1;
                self.stats.abandoned_tbs += 1;
                log::warn!(
                    target: LOG_TARGET,
                    "{:?} UE {} pid {}: {} bits dropped after last redundancy version",
                    direction,
                    ue,
                    pid,
                    tbs_bits
                );
            }
            HarqOutcome::Ignored => {
                log_checks!(
                    self.config.verbosity,
                    "{:?} feedback for idle pid {} of UE {} ignored",
                    direction,
                    pid,
                    ue
                );
            }
        }
        Ok(outcome)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    pub fn run_dl_scheduler(&mut self, timing: TimingInfo) -> Vec<Grant> {
        self.run_scheduler(Direction::Downlink, timing)
    }

    pub fn run_ul_scheduler(&mut self, timing: TimingInfo) -> Vec<Grant> {
        self.run_scheduler(Direction::Uplink, timing)
    }

    /// Schedule every slot the selector hands out at `timing`.
    ///
    /// Retransmissions are carved before new transmissions in each slot. An
    /// empty result is normal: nothing selected, nothing pending or no room.
    fn run_scheduler(&mut self, direction: Direction, timing: TimingInfo) -> Vec<Grant> {
        let d = direction.index();
        let spf = self.layout.slots_per_frame;
        let now = timing.slot_point(spf);
        let targets = self.selector.select(direction, now);

        let mut grants = Vec::new();
        for target in targets {
            let params = &self.params[d];
            if target.num_symbols < params.min_symbols() {
                log_checks!(
                    params.verbosity,
                    "{:?} slot {}: {} usable symbols, skipped",
                    direction,
                    target.slot.0,
                    target.num_symbols
                );
                continue;
            }
            let (frame, slot) = target.slot.to_frame_slot(spf);
            let job = SlotJob {
                target,
                frame,
                slot,
                feedback_offset: (direction == Direction::Downlink)
                    .then(|| self.selector.feedback_offset(target.slot)),
            };

            let mut allocator = SlotAllocator::new(params, job, self.oracle.as_ref());
            allocator.carve_retx(&mut self.harq[d], &self.ues, &mut self.rng, &mut self.stats);
            allocator.carve_new_tx(
                &mut self.harq[d],
                &mut self.ues,
                self.strategy.as_mut(),
                &mut self.stats,
            );
            grants.extend(allocator.into_grants());
        }
        grants
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Jain's fairness index of acknowledged throughput over connected UEs.
    pub fn fairness_index(&self, direction: Direction) -> f64 {
        self.throughput.fairness_index(direction)
    }

    pub fn delivered_bits(&self, direction: Direction, ue: UeId) -> u64 {
        self.throughput.delivered_bits(direction, ue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::ResourceMask;
    use crate::models::{Allocation, TxKind};
    use crate::phy::CapacityRequest;

    /// 100 bits per RB and layer from MCS 20 up, 50 below.
    struct StubCapacity;

    impl CapacityOracle for StubCapacity {
        fn capacity_bits(&self, req: &CapacityRequest) -> u32 {
            if req.num_symbols == 0 {
                return 0;
            }
            let per_rb = if req.mcs < 20 { 50 } else { 100 };
            per_rb * req.num_rbs as u32 * req.layers as u32
        }
    }

    fn scheduler(config: SchedulerConfig) -> MacScheduler {
        let _ = env_logger::builder().is_test(true).try_init();
        let strategy = Box::new(RoundRobin::new(
            MacScheduler::mu_mimo_params(&config),
            config.verbosity,
        ));
        MacScheduler::with_components(config, Box::new(StubCapacity), strategy).unwrap()
    }

    fn connect(s: &mut MacScheduler, ue: UeId, cqi: u8) {
        s.add_connection(
            ue,
            ConnectionParams {
                initial_cqi: cqi,
                ..ConnectionParams::default()
            },
        )
        .unwrap();
    }

    fn at(slot: u32) -> TimingInfo {
        TimingInfo::new(slot / 10, slot % 10, 0)
    }

    #[test]
    fn test_single_ue_fdd_rat0_new_tx() {
        let mut s = scheduler(SchedulerConfig::default());
        connect(&mut s, 1, 12);
        // 40 bytes fit in one RBG (4 RBs x 100 bits)
        s.update_dl_buffer_status(1, 4, 40).unwrap();
        assert!(!s.harq(Direction::Downlink).process(1, 0).unwrap().ndi);

        let grants = s.run_dl_scheduler(at(0));
        assert_eq!(grants.len(), 1);
        let g = &grants[0];
        assert_eq!(g.kind, TxKind::NewTx);
        assert_eq!(g.harq_id, 0);
        assert!(g.ndi);
        let mut rbg0 = ResourceMask::new(13);
        rbg0.set(0);
        assert_eq!(g.allocation, Allocation::RbgBitmap(rbg0));
        assert_eq!((g.start_symbol, g.num_symbols), (1, 13));
        assert_eq!(g.feedback_offset, Some(1));
        assert_eq!(s.stats().new_tx_grants, 1);
    }

    #[test]
    fn test_rv_exhaustion_frees_process() {
        let config = SchedulerConfig {
            rv_sequence: vec![0, 2],
            ..SchedulerConfig::default()
        };
        let mut s = scheduler(config);
        connect(&mut s, 1, 12);
        s.update_dl_buffer_status(1, 4, 40).unwrap();
        let g = s.run_dl_scheduler(at(0)).remove(0);

        assert_eq!(
            s.on_rx_result(Direction::Downlink, 1, g.harq_id, false).unwrap(),
            HarqOutcome::RetxPending
        );
        let retx = s.run_dl_scheduler(at(1));
        assert_eq!(retx.len(), 1);
        assert_eq!(retx[0].kind, TxKind::ReTx);
        assert_eq!(retx[0].ndi, g.ndi);
        assert_eq!(retx[0].rv, 2);

        assert_eq!(
            s.on_rx_result(Direction::Downlink, 1, g.harq_id, false).unwrap(),
            HarqOutcome::Abandoned { tbs_bits: 400 }
        );
        assert_eq!(s.stats().abandoned_tbs, 1);
        assert!(s.harq(Direction::Downlink).retx_context(1, 0).is_none());
        assert_eq!(s.harq(Direction::Downlink).find_free_process(1), Some(0));

        // Stale feedback changes nothing
        assert_eq!(
            s.on_rx_result(Direction::Downlink, 1, g.harq_id, true).unwrap(),
            HarqOutcome::Ignored
        );
        assert_eq!(s.delivered_bits(Direction::Downlink, 1), 0);
        assert!(s.run_dl_scheduler(at(2)).is_empty());
    }

    #[test]
    fn test_retx_preempts_new_tx_for_same_ue() {
        let mut s = scheduler(SchedulerConfig::default());
        connect(&mut s, 1, 12);
        s.update_dl_buffer_status(1, 4, 40).unwrap();
        let first = s.run_dl_scheduler(at(0)).remove(0);
        s.on_rx_result(Direction::Downlink, 1, first.harq_id, false)
            .unwrap();
        s.update_dl_buffer_status(1, 4, 5000).unwrap();

        let grants = s.run_dl_scheduler(at(1));
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].kind, TxKind::ReTx);
    }

    #[test]
    fn test_mu_pairing_refused_when_it_saves_nothing() {
        let config = SchedulerConfig {
            mu_mimo_enabled: true,
            ..SchedulerConfig::default()
        };
        let mut s = scheduler(config);
        for ue in [1, 2] {
            connect(&mut s, ue, 12);
            // SU at CQI 12 (MCS 22): 800 bits in 8 RBs. The MU backoff lands
            // on MCS 18, halving the payload, so each paired UE still costs 8.
            s.update_dl_buffer_status(ue, 4, 100).unwrap();
        }
        let weights = [vec![(1.0, 0.0), (0.0, 0.0)], vec![(0.0, 0.0), (1.0, 0.0)]];
        for (ue, w) in [(1, &weights[0]), (2, &weights[1])] {
            let csi = CsiMeasurement::wideband(12, 1).with_weights(Some(w.clone()));
            s.update_channel_quality(Direction::Downlink, ue, csi).unwrap();
        }

        let grants = s.run_dl_scheduler(at(0));
        assert_eq!(grants.len(), 2);
        let (Allocation::RbgBitmap(a), Allocation::RbgBitmap(b)) =
            (&grants[0].allocation, &grants[1].allocation)
        else {
            panic!("RAT-0 grants expected");
        };
        assert!(!a.intersects(b));
        assert_eq!(s.stats().mu_paired_rbgs, 0);
    }

    #[test]
    fn test_tdd_ul_selects_early_slots() {
        let config = SchedulerConfig {
            duplex: "tdd".to_string(),
            tdd_pattern: "DL|DL|S|UL|UL".to_string(),
            special_dl_symbols: 8,
            special_guard_symbols: 2,
            special_ul_symbols: 4,
            ul_prep_symbols: 1,
            ..SchedulerConfig::default()
        };
        let mut s = scheduler(config);
        connect(&mut s, 1, 12);
        s.update_ul_buffer_status(1, 0, 100_000).unwrap();

        // From slot 1 the next DL start (slot 2) is still early enough
        assert!(s.run_ul_scheduler(at(1)).is_empty());

        // From slot 2 the S, UL and UL slots cannot wait for slot 5
        let grants = s.run_ul_scheduler(at(2));
        let slots: Vec<u32> = grants.iter().map(|g| g.slot).collect();
        assert_eq!(slots, vec![2, 3, 4]);
        assert_eq!(grants[0].start_symbol, 10);
        assert_eq!(grants[0].num_symbols, 4);
        assert_eq!(grants[0].feedback_offset, None);
        // Nothing is scheduled twice
        assert!(s.run_ul_scheduler(at(2)).is_empty());
    }

    #[test]
    fn test_seeded_runs_are_identical() {
        let run = || {
            let mut s = scheduler(SchedulerConfig {
                allocation_type: "rat1".to_string(),
                random_seed: 42,
                ..SchedulerConfig::default()
            });
            for ue in 1..=5 {
                connect(&mut s, ue, 12);
                s.update_dl_buffer_status(ue, 4, 40).unwrap();
            }
            let mut all = s.run_dl_scheduler(at(0));
            for g in all.clone() {
                s.on_rx_result(Direction::Downlink, g.ue, g.harq_id, false)
                    .unwrap();
            }
            all.extend(s.run_dl_scheduler(at(1)));
            all
        };
        let first = run();
        assert_eq!(first.len(), 10);
        assert_eq!(first, run());
    }

    #[test]
    fn test_connection_errors() {
        let mut s = scheduler(SchedulerConfig::default());
        connect(&mut s, 1, 12);
        assert_eq!(
            s.add_connection(1, ConnectionParams::default()),
            Err(SchedulerError::DuplicateUe(1))
        );
        assert_eq!(
            s.update_dl_buffer_status(9, 1, 10),
            Err(SchedulerError::UnknownUe(9))
        );
        assert_eq!(
            s.update_ul_buffer_status(1, 8, 10),
            Err(SchedulerError::Buffer(BufferError::LcgOutOfRange(8)))
        );
        assert!(matches!(
            s.on_rx_result(Direction::Uplink, 1, 40, true),
            Err(SchedulerError::Harq(HarqError::ProcessOutOfRange { .. }))
        ));
        s.remove_connection(1).unwrap();
        assert_eq!(s.num_connections(), 0);
        assert_eq!(s.remove_connection(1), Err(SchedulerError::UnknownUe(1)));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = SchedulerConfig {
            rbg_size: 3,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            MacScheduler::new(config),
            Err(SchedulerError::Config(ConfigError::RbgSize(3)))
        ));
    }

    #[test]
    fn test_bsr_and_fairness() {
        let mut s = scheduler(SchedulerConfig::default());
        connect(&mut s, 1, 12);
        connect(&mut s, 2, 12);
        // LCG 1 at level 7 (74 bytes)
        s.process_bsr(1, &[(1 << 5) | 7]).unwrap();
        assert_eq!(s.ue(1).unwrap().buffer(Direction::Uplink).total(), 74);

        s.update_dl_buffer_status(1, 4, 40).unwrap();
        s.update_dl_buffer_status(2, 4, 40).unwrap();
        for g in s.run_dl_scheduler(at(0)) {
            s.on_rx_result(Direction::Downlink, g.ue, g.harq_id, true)
                .unwrap();
        }
        assert!((s.fairness_index(Direction::Downlink) - 1.0).abs() < 1e-12);
        assert_eq!(s.stats().delivered_tbs, 2);
    }
}
