//! Resource allocation engine for one slot.
//!
//! A [`SlotAllocator`] owns the occupancy of one slot in one direction. The
//! scheduler first runs [`SlotAllocator::carve_retx`] and then
//! [`SlotAllocator::carve_new_tx`] against it, and collects the grants.
//!
//! Occupancy is kept in RBG units for RAT-0 and RB units for RAT-1.

mod newtx;
mod retx;

use rustc_hash::FxHashSet;

use crate::config::{AllocationType, CellLayout, SchedulerConfig};
use crate::mask::ResourceMask;
use crate::models::{
    rbg_width, Allocation, Direction, Grant, HarqId, MappingType, TxKind, UeId,
};
use crate::phy::{CapacityOracle, CapacityRequest};
use crate::slot::SlotTarget;

/// Allocation parameters for one direction, fixed at construction.
#[derive(Clone, Debug)]
pub struct AllocParams {
    pub direction: Direction,
    pub allocation_type: AllocationType,
    pub num_rbs: u16,
    pub rbg_size: u16,
    pub num_rbgs: u16,
    pub mapping_type: MappingType,
    pub dmrs_symbols: u8,
    pub max_mcs: u8,
    /// Per-UE RB ceiling for new transmissions.
    pub max_rb_per_ue: u16,
    pub adaptive_retx: bool,
    /// MU-MIMO pairing active for this direction.
    pub mu_mimo: bool,
    pub mu_cqi_backoff: u8,
    pub verbosity: u8,
}

impl AllocParams {
    pub fn new(config: &SchedulerConfig, layout: &CellLayout, direction: Direction) -> Self {
        let (num_rbs, num_rbgs) = match direction {
            Direction::Downlink => (layout.dl_rbs, layout.dl_rbgs),
            Direction::Uplink => (layout.ul_rbs, layout.ul_rbgs),
        };
        Self {
            direction,
            allocation_type: layout.allocation_type,
            num_rbs,
            rbg_size: layout.rbg_size,
            num_rbgs,
            mapping_type: layout.mapping_type,
            dmrs_symbols: config.dmrs_symbols,
            max_mcs: config.max_mcs,
            max_rb_per_ue: config.max_rb_per_ue.unwrap_or(num_rbs).min(num_rbs),
            adaptive_retx: config.adaptive_retx,
            mu_mimo: config.mu_mimo_enabled && direction == Direction::Downlink,
            mu_cqi_backoff: config.mu_cqi_backoff,
            verbosity: config.verbosity,
        }
    }

    /// Fewest symbols a grant may span.
    pub fn min_symbols(&self) -> u8 {
        match self.mapping_type {
            MappingType::TypeA => 1,
            MappingType::TypeB => 2,
        }
    }
}

/// Where and when the slot being allocated sits.
#[derive(Clone, Copy, Debug)]
pub struct SlotJob {
    pub target: SlotTarget,
    pub frame: u32,
    pub slot: u32,
    /// K1, downlink only.
    pub feedback_offset: Option<u8>,
}

/// Working state while carving one slot.
pub struct SlotAllocator<'a> {
    params: &'a AllocParams,
    job: SlotJob,
    oracle: &'a dyn CapacityOracle,
    /// Occupied RBGs (RAT-0) or RBs (RAT-1).
    used: ResourceMask,
    /// UEs that got a retransmission in this slot.
    retx_served: FxHashSet<UeId>,
    grants: Vec<Grant>,
}

impl<'a> SlotAllocator<'a> {
    pub fn new(params: &'a AllocParams, job: SlotJob, oracle: &'a dyn CapacityOracle) -> Self {
        let units = match params.allocation_type {
            AllocationType::Rat0 => params.num_rbgs,
            AllocationType::Rat1 => params.num_rbs,
        };
        Self {
            params,
            job,
            oracle,
            used: ResourceMask::new(units),
            retx_served: FxHashSet::default(),
            grants: Vec::new(),
        }
    }

    pub fn into_grants(self) -> Vec<Grant> {
        self.grants
    }

    fn free_mask(&self) -> ResourceMask {
        let mut free = ResourceMask::full(self.used.len());
        free.subtract(&self.used);
        free
    }

    fn mark_used(&mut self, allocation: &Allocation) {
        match allocation {
            Allocation::RbgBitmap(mask) => self.used.union_with(mask),
            Allocation::RbRange { start, len } => self.used.set_range(*start, *len),
        }
    }

    /// RBs covered by a set of RBGs.
    fn rbg_mask_rbs(&self, mask: &ResourceMask) -> u16 {
        mask.iter_set()
            .map(|rbg| rbg_width(rbg, self.params.rbg_size, self.params.num_rbs))
            .sum()
    }

    fn request(&self, layers: u8, mcs: u8, num_rbs: u16) -> CapacityRequest {
        CapacityRequest {
            direction: self.params.direction,
            layers,
            mapping_type: self.params.mapping_type,
            start_symbol: self.job.target.start_symbol,
            num_symbols: self.job.target.num_symbols,
            num_rbs,
            mcs,
            dmrs_symbols: self.params.dmrs_symbols,
        }
    }

    fn capacity(&self, layers: u8, mcs: u8, num_rbs: u16) -> u32 {
        self.oracle
            .capacity_bits(&self.request(layers, mcs, num_rbs))
    }

    /// Grant skeleton with the slot fields filled in.
    fn grant(&self, ue: UeId, kind: TxKind, harq_id: HarqId, allocation: Allocation) -> Grant {
        let target = &self.job.target;
        Grant {
            ue,
            direction: self.params.direction,
            kind,
            harq_id,
            allocation,
            frame: self.job.frame,
            slot: self.job.slot,
            slot_offset: target.offset,
            start_symbol: target.start_symbol,
            num_symbols: target.num_symbols,
            mcs: 0,
            ndi: false,
            layers: 1,
            rv: 0,
            precoder: 0,
            tbs_bits: 0,
            feedback_offset: self.job.feedback_offset,
        }
    }
}

/// Floor of the mean of per-RBG MCS values.
fn average_mcs(values: &[u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    let sum: u32 = values.iter().map(|v| *v as u32).sum();
    (sum / values.len() as u32) as u8
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_occupancy_units_follow_allocation_type() {
        let oracle = PerRbCapacity { bits_per_rb: 100 };
        let rat0 = params(AllocationType::Rat0, Direction::Downlink);
        let rat1 = params(AllocationType::Rat1, Direction::Downlink);
        assert_eq!(SlotAllocator::new(&rat0, job(), &oracle).used.len(), 13);
        assert_eq!(SlotAllocator::new(&rat1, job(), &oracle).used.len(), 52);
    }

    #[test]
    fn test_grant_skeleton_carries_slot_fields() {
        let oracle = PerRbCapacity { bits_per_rb: 100 };
        let p = params(AllocationType::Rat1, Direction::Downlink);
        let alloc = SlotAllocator::new(&p, job(), &oracle);
        let grant = alloc.grant(3, TxKind::NewTx, 2, Allocation::RbRange { start: 0, len: 4 });
        assert_eq!((grant.frame, grant.slot), (0, 4));
        assert_eq!((grant.start_symbol, grant.num_symbols), (1, 13));
        assert_eq!(grant.feedback_offset, Some(4));
    }

    #[test]
    fn test_average_mcs_floors() {
        assert_eq!(average_mcs(&[10, 11]), 10);
        assert_eq!(average_mcs(&[7]), 7);
        assert_eq!(average_mcs(&[]), 0);
    }

    #[test]
    fn test_mu_mimo_is_downlink_only() {
        let config = SchedulerConfig {
            mu_mimo_enabled: true,
            ..SchedulerConfig::default()
        };
        let layout = config.validate().unwrap();
        assert!(AllocParams::new(&config, &layout, Direction::Downlink).mu_mimo);
        assert!(!AllocParams::new(&config, &layout, Direction::Uplink).mu_mimo);
        assert_eq!(
            AllocParams::new(&config, &layout, Direction::Uplink).max_rb_per_ue,
            52
        );
    }
}
