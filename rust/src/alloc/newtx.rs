//! New-transmission carving.
//!
//! Candidates are UEs with data, a free HARQ process and no retransmission in
//! this slot. RAT-0 offers the free RBGs one at a time to the strategy; RAT-1
//! offers the longest free RB run as one block. Every UE that ends up with
//! resources is given one new transport block on its lowest free process.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::config::AllocationType;
use crate::harq::{HarqManager, TxSnapshot};
use crate::logging::LOG_TARGET;
use crate::mask::ResourceMask;
use crate::models::{rbg_width, Allocation, TxKind, UeId};
use crate::phy::rbs_for_bits;
use crate::scheduler::{SchedulerStats, UeState};
use crate::strategy::{
    BlockContext, Candidate, OrthogonalityMatrix, ResourceContext, SchedulingStrategy,
};
use crate::{log_changes, log_checks, log_debug};

use super::{average_mcs, SlotAllocator};

/// Resources won by one UE, before the transport block is sized.
#[derive(Clone, Debug, PartialEq)]
struct NewTxDraft {
    ue: UeId,
    allocation: Allocation,
    mcs: u8,
    layers: u8,
}

impl SlotAllocator<'_> {
    /// Hand the resources left after retransmissions to new transmissions.
    pub fn carve_new_tx(
        &mut self,
        harq: &mut HarqManager,
        ues: &mut FxHashMap<UeId, UeState>,
        strategy: &mut dyn SchedulingStrategy,
        stats: &mut SchedulerStats,
    ) {
        let mut candidates = self.candidates(harq, ues);
        if candidates.is_empty() {
            log_checks!(
                self.params.verbosity,
                "  {:?} slot {}: no eligible UE",
                self.params.direction,
                self.job.slot
            );
            return;
        }
        if self.free_mask().none() {
            return;
        }

        strategy.begin_tti(self.params.direction);
        let drafts = match self.params.allocation_type {
            AllocationType::Rat0 => self.carve_rbgs(&mut candidates, ues, strategy, stats),
            AllocationType::Rat1 => self.carve_block(&candidates, ues, strategy),
        };
        for draft in drafts {
            self.commit_new_tx(draft, harq, ues, stats);
        }
    }

    /// Eligible UEs in ascending ID order with their RB requirements.
    fn candidates(&self, harq: &HarqManager, ues: &FxHashMap<UeId, UeState>) -> Vec<Candidate> {
        let p = self.params;
        let direction = p.direction;
        let mut candidates = Vec::new();
        for (ue, state) in ues {
            if self.retx_served.contains(ue) {
                log_debug!(p.verbosity, "  UE {}: retransmission this slot", ue);
                continue;
            }
            let buffer = state.buffer(direction).total();
            if buffer == 0 {
                continue;
            }
            if !harq.has_free_process(*ue) {
                log_checks!(p.verbosity, "  UE {}: all HARQ processes busy", ue);
                continue;
            }
            let csi = state.csi(direction);
            let Some(su_mcs) = csi.wideband_mcs(0, p.max_mcs) else {
                log_checks!(p.verbosity, "  UE {}: CQI 0, not schedulable", ue);
                continue;
            };
            let rank = state.rank(direction);
            let bits = buffer.saturating_mul(8);
            let su_req_rbs = self.required_rbs(rank, su_mcs, bits);
            let (mu_mcs, mu_req_rbs) = if p.mu_mimo {
                let mu_mcs = csi.wideband_mcs(p.mu_cqi_backoff, p.max_mcs);
                // Paired UEs share their RBs, so each is charged half of them
                (mu_mcs, mu_mcs.map(|m| self.required_rbs(rank, m, bits).div_ceil(2)))
            } else {
                (None, None)
            };
            candidates.push(Candidate {
                ue: *ue,
                wideband_cqi: csi.wideband_cqi,
                su_mcs,
                mu_mcs,
                rank,
                beam_id: csi.beam_id,
                su_req_rbs,
                mu_req_rbs,
                assigned_rbs: 0,
            });
        }
        candidates.sort_unstable_by_key(|c| c.ue);
        candidates
    }

    /// RBs to carry `bits`, capped at the per-UE ceiling.
    fn required_rbs(&self, layers: u8, mcs: u8, bits: u32) -> u16 {
        let cap = self.params.max_rb_per_ue;
        rbs_for_bits(self.oracle, &self.request(layers, mcs, 0), bits, cap).unwrap_or(cap)
    }

    fn carve_rbgs(
        &mut self,
        candidates: &mut [Candidate],
        ues: &FxHashMap<UeId, UeState>,
        strategy: &mut dyn SchedulingStrategy,
        stats: &mut SchedulerStats,
    ) -> Vec<NewTxDraft> {
        let p = self.params;
        let matrix = if p.mu_mimo {
            OrthogonalityMatrix::from_precoders(candidates.iter().filter_map(|c| {
                let weights = ues.get(&c.ue)?.csi(p.direction).precoder_weights.as_deref()?;
                Some((c.ue, weights))
            }))
        } else {
            None
        };

        // UE -> (RBGs, per-RBG MCS)
        let mut won: BTreeMap<UeId, (ResourceMask, Vec<u8>)> = BTreeMap::new();
        let free: Vec<u16> = self.free_mask().iter_set().collect();
        for rbg in free {
            let open: Vec<Candidate> = candidates
                .iter()
                .filter(|c| !c.is_satisfied())
                .cloned()
                .collect();
            if open.is_empty() {
                break;
            }
            let width = rbg_width(rbg, p.rbg_size, p.num_rbs);
            let ctx = ResourceContext {
                direction: p.direction,
                rbg,
                num_rbs: width,
                candidates: &open,
                orthogonality: matrix.as_ref(),
            };
            let Some(selection) = strategy.select_ue_for_resource(&ctx) else {
                break;
            };
            strategy.on_resource_assigned(p.direction, selection.ue);
            self.used.set(rbg);

            let backoff = if selection.partner.is_some() {
                stats.mu_paired_rbgs += 1;
                p.mu_cqi_backoff
            } else {
                0
            };
            for ue in std::iter::once(selection.ue).chain(selection.partner) {
                let Some(state) = ues.get(&ue) else {
                    continue;
                };
                let mcs = state
                    .csi(p.direction)
                    .rbg_mcs(rbg, p.rbg_size, p.num_rbs, backoff, p.max_mcs)
                    .unwrap_or(0);
                let entry = won
                    .entry(ue)
                    .or_insert_with(|| (ResourceMask::new(p.num_rbgs), Vec::new()));
                entry.0.set(rbg);
                entry.1.push(mcs);
                if let Some(c) = candidates.iter_mut().find(|c| c.ue == ue) {
                    c.assigned_rbs += width;
                }
            }
        }

        won.into_iter()
            .filter_map(|(ue, (mask, mcs_values))| {
                let layers = candidates.iter().find(|c| c.ue == ue)?.rank;
                Some(NewTxDraft {
                    ue,
                    allocation: Allocation::RbgBitmap(mask),
                    mcs: average_mcs(&mcs_values),
                    layers,
                })
            })
            .collect()
    }

    fn carve_block(
        &mut self,
        candidates: &[Candidate],
        ues: &FxHashMap<UeId, UeState>,
        strategy: &mut dyn SchedulingStrategy,
    ) -> Vec<NewTxDraft> {
        let p = self.params;
        let Some((start, len)) = self.free_mask().longest_run() else {
            return Vec::new();
        };
        let ctx = BlockContext {
            direction: p.direction,
            start,
            len,
            candidates,
        };
        let allotments = strategy.select_ues_for_block(&ctx);

        let mut drafts = Vec::with_capacity(allotments.len());
        for allotment in allotments {
            let inside = allotment.len > 0
                && allotment.start >= start
                && allotment.start + allotment.len <= start + len;
            if !inside || !self.free_mask().all_set(allotment.start, allotment.len) {
                log::warn!(
                    target: LOG_TARGET,
                    "strategy returned unusable range {}+{} for UE {}",
                    allotment.start,
                    allotment.len,
                    allotment.ue
                );
                continue;
            }
            let (Some(state), Some(candidate)) = (
                ues.get(&allotment.ue),
                candidates.iter().find(|c| c.ue == allotment.ue),
            ) else {
                continue;
            };
            strategy.on_resource_assigned(p.direction, allotment.ue);
            self.used.set_range(allotment.start, allotment.len);
            let mcs = state
                .csi(p.direction)
                .range_mcs(allotment.start, allotment.len, p.max_mcs)
                .unwrap_or(0);
            drafts.push(NewTxDraft {
                ue: allotment.ue,
                allocation: Allocation::RbRange {
                    start: allotment.start,
                    len: allotment.len,
                },
                mcs,
                layers: candidate.rank,
            });
        }
        drafts
    }

    /// Size the transport block, open a HARQ process and drain the buffer.
    fn commit_new_tx(
        &mut self,
        draft: NewTxDraft,
        harq: &mut HarqManager,
        ues: &mut FxHashMap<UeId, UeState>,
        stats: &mut SchedulerStats,
    ) {
        let p = self.params;
        let num_rbs = draft.allocation.num_rbs(p.rbg_size, p.num_rbs);
        let tbs_bits = self.capacity(draft.layers, draft.mcs, num_rbs);
        if tbs_bits == 0 {
            log_checks!(
                p.verbosity,
                "  UE {}: {} RBs at MCS {} carry nothing",
                draft.ue,
                num_rbs,
                draft.mcs
            );
            return;
        }
        let (Some(pid), Some(state)) = (harq.find_free_process(draft.ue), ues.get_mut(&draft.ue))
        else {
            return;
        };
        let precoder = state.csi(p.direction).precoder;
        let snapshot = TxSnapshot {
            allocation: draft.allocation.clone(),
            start_symbol: self.job.target.start_symbol,
            num_symbols: self.job.target.num_symbols,
            mcs: draft.mcs,
            layers: draft.layers,
            precoder,
            tbs_bits,
        };
        let (rv, ndi) = match harq.begin_new_tx(draft.ue, pid, snapshot) {
            Ok(v) => v,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "new tx for UE {} skipped: {}", draft.ue, e);
                return;
            }
        };
        state.buffer_mut(p.direction).consume(tbs_bits / 8);
        stats.new_tx_grants += 1;

        let mut grant = self.grant(draft.ue, TxKind::NewTx, pid, draft.allocation);
        grant.mcs = draft.mcs;
        grant.ndi = ndi;
        grant.layers = draft.layers;
        grant.rv = rv;
        grant.precoder = precoder;
        grant.tbs_bits = tbs_bits;
        log_changes!(
            p.verbosity,
            "  {:?} NewTx UE {} pid {} {} RBs mcs {} tbs {} in slot {}",
            p.direction,
            draft.ue,
            pid,
            num_rbs,
            draft.mcs,
            tbs_bits,
            self.job.slot
        );
        self.grants.push(grant);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{AllocParams, SlotAllocator};
    use super::*;
    use crate::csi::CsiMeasurement;
    use crate::models::{Direction, Grant};
    use crate::strategy::{MuMimoParams, RoundRobin};

    const BITS_PER_RB: u32 = 100;

    struct Cell {
        harq: HarqManager,
        ues: FxHashMap<UeId, UeState>,
        strategy: RoundRobin,
        stats: SchedulerStats,
    }

    impl Cell {
        fn new(strategy: RoundRobin) -> Self {
            Self {
                harq: HarqManager::new(vec![0, 2, 3, 1]),
                ues: FxHashMap::default(),
                strategy,
                stats: SchedulerStats::default(),
            }
        }

        fn add(&mut self, ue: UeId, direction: Direction, bytes: u32) {
            let mut state = UeState::new(ue, 1, 12);
            state.buffer_mut(direction).set(1, bytes);
            self.ues.insert(ue, state);
            self.harq.add_ue(ue, 2);
        }

        fn run(&mut self, params: &AllocParams) -> Vec<Grant> {
            let oracle = PerRbCapacity {
                bits_per_rb: BITS_PER_RB,
            };
            let mut alloc = SlotAllocator::new(params, job(), &oracle);
            alloc.carve_new_tx(
                &mut self.harq,
                &mut self.ues,
                &mut self.strategy,
                &mut self.stats,
            );
            alloc.into_grants()
        }
    }

    #[test]
    fn test_single_ue_small_buffer_gets_one_rbg() {
        let p = params(AllocationType::Rat0, Direction::Downlink);
        let mut cell = Cell::new(RoundRobin::new(None, 0));
        cell.add(1, Direction::Downlink, 40);

        let grants = cell.run(&p);
        assert_eq!(grants.len(), 1);
        let g = &grants[0];
        assert_eq!(g.kind, TxKind::NewTx);
        assert_eq!(g.harq_id, 0);
        assert!(g.ndi);
        assert_eq!(g.rv, 0);
        let mut expected = ResourceMask::new(13);
        expected.set(0);
        assert_eq!(g.allocation, Allocation::RbgBitmap(expected));
        assert_eq!(g.tbs_bits, 400);
        // 400 bits drain 50 bytes, more than was queued
        assert!(cell.ues[&1].buffer(Direction::Downlink).is_empty());
        assert_eq!(cell.harq.find_free_process(1), Some(1));
    }

    #[test]
    fn test_rat0_bitmaps_disjoint_and_capped() {
        let p = AllocParams {
            max_rb_per_ue: 8,
            ..params(AllocationType::Rat0, Direction::Downlink)
        };
        let mut cell = Cell::new(RoundRobin::new(None, 0));
        for ue in 1..=3 {
            cell.add(ue, Direction::Downlink, 100_000);
        }
        let grants = cell.run(&p);
        assert_eq!(grants.len(), 3);

        let mut seen = ResourceMask::new(13);
        for g in &grants {
            let Allocation::RbgBitmap(mask) = &g.allocation else {
                panic!("RAT-0 grant without bitmap");
            };
            assert!(!seen.intersects(mask));
            seen.union_with(mask);
            assert_eq!(g.allocation.num_rbs(4, 52), 8);
        }
        // RBGs interleave in round-robin order
        assert_eq!(grants[0].allocation.num_rbs(4, 52), 8);
        let Allocation::RbgBitmap(first) = &grants[0].allocation else {
            unreachable!()
        };
        assert_eq!(first.iter_set().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_ue_with_retx_or_without_process_skipped() {
        let p = params(AllocationType::Rat0, Direction::Downlink);
        let mut cell = Cell::new(RoundRobin::new(None, 0));
        cell.add(1, Direction::Downlink, 1000);
        cell.add(2, Direction::Downlink, 1000);
        cell.add(3, Direction::Downlink, 0);
        // UE 2 has both processes busy
        for pid in 0..2 {
            let snap = TxSnapshot {
                allocation: Allocation::RbRange { start: 0, len: 1 },
                start_symbol: 1,
                num_symbols: 13,
                mcs: 5,
                layers: 1,
                precoder: 0,
                tbs_bits: 100,
            };
            cell.harq.begin_new_tx(2, pid, snap).unwrap();
        }
        let grants = cell.run(&p);
        assert_eq!(grants.iter().map(|g| g.ue).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_rat1_ranges_disjoint_within_carrier() {
        let p = params(AllocationType::Rat1, Direction::Uplink);
        let mut cell = Cell::new(RoundRobin::new(None, 0));
        cell.add(1, Direction::Uplink, 250);
        cell.add(2, Direction::Uplink, 100_000);

        let grants = cell.run(&p);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].allocation, Allocation::RbRange { start: 0, len: 20 });
        assert_eq!(grants[1].allocation, Allocation::RbRange { start: 20, len: 32 });
        assert_eq!(cell.strategy.last_granted(Direction::Uplink), Some(2));
        assert_eq!(cell.ues[&2].buffer(Direction::Uplink).total(), 100_000 - 400);
    }

    #[test]
    fn test_mu_pair_shares_rbgs() {
        let p = AllocParams {
            mu_mimo: true,
            max_rb_per_ue: 8,
            ..params(AllocationType::Rat0, Direction::Downlink)
        };
        let mu = MuMimoParams {
            min_rbs: 4,
            min_cqi: 7,
            semi_orthogonality: 0.3,
        };
        let mut cell = Cell::new(RoundRobin::new(Some(mu), 0));
        cell.add(1, Direction::Downlink, 100_000);
        cell.add(2, Direction::Downlink, 100_000);
        let weights = [vec![(1.0, 0.0), (0.0, 0.0)], vec![(0.0, 0.0), (1.0, 0.0)]];
        for (ue, w) in [(1u16, &weights[0]), (2u16, &weights[1])] {
            let csi = CsiMeasurement::wideband(12, 1).with_weights(Some(w.clone()));
            cell.ues.get_mut(&ue).unwrap().set_csi(Direction::Downlink, csi);
        }

        let grants = cell.run(&p);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].allocation, grants[1].allocation);
        assert_eq!(cell.stats.mu_paired_rbgs, 2);
    }
}
