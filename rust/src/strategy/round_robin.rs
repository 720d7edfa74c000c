//! Round-robin strategy with optional downlink MU-MIMO pairing.

use crate::models::{Direction, UeId};
use crate::log_debug;

use super::{
    Allotment, BlockContext, Candidate, MuMimoParams, ResourceContext, SchedulingStrategy,
    Selection,
};

/// Serves eligible UEs in ID order, resuming after the last UE that actually
/// received resources. One cursor per direction.
#[derive(Clone, Debug, Default)]
pub struct RoundRobin {
    last_granted: [Option<UeId>; 2],
    mu_mimo: Option<MuMimoParams>,
    verbosity: u8,
}

impl RoundRobin {
    pub fn new(mu_mimo: Option<MuMimoParams>, verbosity: u8) -> Self {
        Self {
            last_granted: [None; 2],
            mu_mimo,
            verbosity,
        }
    }

    pub fn last_granted(&self, direction: Direction) -> Option<UeId> {
        self.last_granted[direction.index()]
    }

    /// Candidates in service order: first UE after the cursor, wrapping.
    fn service_order<'a>(
        &self,
        direction: Direction,
        candidates: &'a [Candidate],
    ) -> impl Iterator<Item = &'a Candidate> + 'a {
        let start = match self.last_granted[direction.index()] {
            Some(cursor) => candidates
                .iter()
                .position(|c| c.ue > cursor)
                .unwrap_or(0),
            None => 0,
        };
        candidates[start..].iter().chain(candidates[..start].iter())
    }

    fn find_partner(&self, winner: &Candidate, ctx: &ResourceContext<'_>) -> Option<UeId> {
        if ctx.direction != Direction::Downlink {
            return None;
        }
        let params = self.mu_mimo.as_ref()?;
        let matrix = ctx.orthogonality?;
        if !params.is_capable(winner) {
            return None;
        }
        self.service_order(ctx.direction, ctx.candidates)
            .filter(|c| c.ue != winner.ue)
            .find(|c| params.can_pair(winner, c, matrix, self.verbosity))
            .map(|c| c.ue)
    }
}

impl SchedulingStrategy for RoundRobin {
    fn select_ue_for_resource(&mut self, ctx: &ResourceContext<'_>) -> Option<Selection> {
        let winner = self
            .service_order(ctx.direction, ctx.candidates)
            .find(|c| !c.is_satisfied())?;
        let partner = self.find_partner(winner, ctx);
        log_debug!(
            self.verbosity,
            "RR {:?} RBG {}: UE {} partner {:?}",
            ctx.direction,
            ctx.rbg,
            winner.ue,
            partner
        );
        Some(Selection {
            ue: winner.ue,
            partner,
        })
    }

    fn select_ues_for_block(&mut self, ctx: &BlockContext<'_>) -> Vec<Allotment> {
        let mut allotments = Vec::new();
        let mut next = ctx.start;
        let end = ctx.start + ctx.len;
        for c in self.service_order(ctx.direction, ctx.candidates) {
            if next >= end {
                break;
            }
            let len = c.remaining_rbs().min(end - next);
            if len == 0 {
                continue;
            }
            allotments.push(Allotment {
                ue: c.ue,
                start: next,
                len,
            });
            next += len;
        }
        allotments
    }

    fn on_resource_assigned(&mut self, direction: Direction, ue: UeId) {
        self.last_granted[direction.index()] = Some(ue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::candidate;
    use crate::strategy::OrthogonalityMatrix;

    fn resource<'a>(candidates: &'a [Candidate], rbg: u16) -> ResourceContext<'a> {
        ResourceContext {
            direction: Direction::Downlink,
            rbg,
            num_rbs: 4,
            candidates,
            orthogonality: None,
        }
    }

    #[test]
    fn test_round_robin_rotates_after_grant() {
        let mut rr = RoundRobin::new(None, 0);
        let cands = vec![candidate(3, 8), candidate(5, 8), candidate(9, 8)];

        let mut served = Vec::new();
        for rbg in 0..4 {
            let sel = rr.select_ue_for_resource(&resource(&cands, rbg)).unwrap();
            rr.on_resource_assigned(Direction::Downlink, sel.ue);
            served.push(sel.ue);
        }
        assert_eq!(served, vec![3, 5, 9, 3]);
        assert_eq!(rr.last_granted(Direction::Downlink), Some(3));
        assert_eq!(rr.last_granted(Direction::Uplink), None);
    }

    #[test]
    fn test_cursor_moves_only_on_assignment() {
        let mut rr = RoundRobin::new(None, 0);
        let cands = vec![candidate(1, 8), candidate(2, 8)];
        let first = rr.select_ue_for_resource(&resource(&cands, 0)).unwrap();
        let again = rr.select_ue_for_resource(&resource(&cands, 0)).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_directions_have_separate_cursors() {
        let mut rr = RoundRobin::new(None, 0);
        rr.on_resource_assigned(Direction::Uplink, 1);
        let cands = vec![candidate(1, 8), candidate(2, 8)];
        let dl = rr.select_ue_for_resource(&resource(&cands, 0)).unwrap();
        assert_eq!(dl.ue, 1);
        let ul_ctx = ResourceContext {
            direction: Direction::Uplink,
            ..resource(&cands, 0)
        };
        assert_eq!(rr.select_ue_for_resource(&ul_ctx).unwrap().ue, 2);
    }

    #[test]
    fn test_block_split_is_contiguous_and_disjoint() {
        let mut rr = RoundRobin::new(None, 0);
        rr.on_resource_assigned(Direction::Uplink, 2);
        let cands = vec![candidate(1, 10), candidate(2, 6), candidate(4, 30)];
        let ctx = BlockContext {
            direction: Direction::Uplink,
            start: 5,
            len: 20,
            candidates: &cands,
        };
        let allotments = rr.select_ues_for_block(&ctx);
        // Service order 4, 1, 2; UE 4 wants more than the block
        assert_eq!(
            allotments,
            vec![Allotment {
                ue: 4,
                start: 5,
                len: 20
            }]
        );

        let cands = vec![candidate(1, 10), candidate(2, 6)];
        let ctx = BlockContext {
            direction: Direction::Uplink,
            start: 0,
            len: 12,
            candidates: &cands,
        };
        let allotments = rr.select_ues_for_block(&ctx);
        assert_eq!(
            allotments,
            vec![
                Allotment {
                    ue: 1,
                    start: 0,
                    len: 10
                },
                Allotment {
                    ue: 2,
                    start: 10,
                    len: 2
                }
            ]
        );
    }

    #[test]
    fn test_mu_partner_found_in_downlink_only() {
        let params = MuMimoParams {
            min_rbs: 4,
            min_cqi: 7,
            semi_orthogonality: 0.3,
        };
        let mut rr = RoundRobin::new(Some(params), 0);
        let a = [(1.0, 0.0), (0.0, 0.0)];
        let b = [(0.0, 0.0), (1.0, 0.0)];
        let matrix = OrthogonalityMatrix::from_precoders([(1, &a[..]), (2, &b[..])]).unwrap();
        let cands: Vec<Candidate> = [1, 2]
            .into_iter()
            .map(|ue| Candidate {
                mu_req_rbs: Some(5),
                ..candidate(ue, 8)
            })
            .collect();
        let ctx = ResourceContext {
            orthogonality: Some(&matrix),
            ..resource(&cands, 0)
        };
        assert_eq!(
            rr.select_ue_for_resource(&ctx).unwrap(),
            Selection {
                ue: 1,
                partner: Some(2)
            }
        );

        let ul = ResourceContext {
            direction: Direction::Uplink,
            orthogonality: Some(&matrix),
            ..resource(&cands, 0)
        };
        assert_eq!(rr.select_ue_for_resource(&ul).unwrap().partner, None);
    }
}
