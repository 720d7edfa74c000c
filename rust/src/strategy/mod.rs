//! New-transmission scheduling strategies.
//!
//! The allocation engine owns the resources; a strategy only decides who gets
//! them. RAT-0 asks per RBG ([`SchedulingStrategy::select_ue_for_resource`]),
//! RAT-1 hands over one contiguous block per slot
//! ([`SchedulingStrategy::select_ues_for_block`]).

mod mu_mimo;
mod round_robin;

pub use mu_mimo::{MuMimoParams, OrthogonalityMatrix};
pub use round_robin::RoundRobin;

use crate::models::{Direction, UeId};

/// A UE eligible for new-transmission resources in the current slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub ue: UeId,
    pub wideband_cqi: u8,
    /// Wideband MCS when served alone.
    pub su_mcs: u8,
    /// Wideband MCS when sharing RBs with an MU-MIMO partner.
    pub mu_mcs: Option<u8>,
    pub rank: u8,
    pub beam_id: u16,
    /// RBs needed to empty the buffer alone, capped by the per-UE ceiling.
    pub su_req_rbs: u16,
    /// RBs charged to the UE when paired: its need at the MU-MIMO MCS, halved
    /// because both UEs of a pair occupy the same RBs.
    pub mu_req_rbs: Option<u16>,
    /// RBs handed out so far in this slot.
    pub assigned_rbs: u16,
}

impl Candidate {
    pub fn remaining_rbs(&self) -> u16 {
        self.su_req_rbs.saturating_sub(self.assigned_rbs)
    }

    pub fn is_satisfied(&self) -> bool {
        self.remaining_rbs() == 0
    }
}

/// One RBG on offer (RAT-0).
pub struct ResourceContext<'a> {
    pub direction: Direction,
    pub rbg: u16,
    /// RBs in this RBG.
    pub num_rbs: u16,
    /// Unsatisfied candidates, ascending UE ID.
    pub candidates: &'a [Candidate],
    pub orthogonality: Option<&'a OrthogonalityMatrix>,
}

/// Winner of one RBG, possibly with a co-scheduled partner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub ue: UeId,
    pub partner: Option<UeId>,
}

/// One contiguous free block on offer (RAT-1).
pub struct BlockContext<'a> {
    pub direction: Direction,
    pub start: u16,
    pub len: u16,
    /// Unsatisfied candidates, ascending UE ID.
    pub candidates: &'a [Candidate],
}

/// Share of a block given to one UE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allotment {
    pub ue: UeId,
    pub start: u16,
    pub len: u16,
}

/// Picks UEs for new-transmission resources.
pub trait SchedulingStrategy {
    /// Called once per scheduled slot before any selection.
    fn begin_tti(&mut self, _direction: Direction) {}

    /// Pick the UE (and optional MU-MIMO partner) for one RBG.
    fn select_ue_for_resource(&mut self, ctx: &ResourceContext<'_>) -> Option<Selection>;

    /// Split a contiguous block into non-overlapping per-UE ranges.
    fn select_ues_for_block(&mut self, ctx: &BlockContext<'_>) -> Vec<Allotment>;

    /// The engine committed resources to `ue`.
    fn on_resource_assigned(&mut self, direction: Direction, ue: UeId);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Candidate;
    use crate::models::UeId;

    pub fn candidate(ue: UeId, su_req_rbs: u16) -> Candidate {
        Candidate {
            ue,
            wideband_cqi: 12,
            su_mcs: 20,
            mu_mcs: Some(16),
            rank: 1,
            beam_id: 0,
            su_req_rbs,
            mu_req_rbs: Some(su_req_rbs),
            assigned_rbs: 0,
        }
    }
}
