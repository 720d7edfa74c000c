//! Retransmission carving.
//!
//! Runs before any new transmission in the slot. UEs with a pending
//! retransmission are visited in a seeded random order and each gets at most
//! one retransmission grant.

use std::cmp::Reverse;

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;

use crate::config::AllocationType;
use crate::csi::CsiMeasurement;
use crate::harq::{HarqManager, TxSnapshot};
use crate::logging::LOG_TARGET;
use crate::mask::ResourceMask;
use crate::models::{Allocation, TxKind, UeId};
use crate::phy::rbs_for_bits;
use crate::scheduler::{SchedulerStats, UeState};
use crate::{log_changes, log_checks, log_debug};

use super::{average_mcs, SlotAllocator};

/// Resources and link parameters chosen for one retransmission.
#[derive(Clone, Debug, PartialEq)]
struct RetxPlan {
    allocation: Allocation,
    mcs: u8,
    layers: u8,
    precoder: u16,
    /// Sent with less capacity than the transport block needs.
    forced: bool,
}

impl SlotAllocator<'_> {
    /// Grant retransmissions for every UE that has one pending and fits.
    pub fn carve_retx(
        &mut self,
        harq: &mut HarqManager,
        ues: &FxHashMap<UeId, UeState>,
        rng: &mut ChaCha8Rng,
        stats: &mut SchedulerStats,
    ) {
        let mut order = harq.ues_with_pending_retx();
        if order.is_empty() {
            return;
        }
        order.shuffle(rng);
        log_debug!(
            self.params.verbosity,
            "  {:?} retx visiting order {:?}",
            self.params.direction,
            order
        );

        for ue in order {
            if self.free_mask().none() {
                log_checks!(
                    self.params.verbosity,
                    "  {:?} slot {} full, UE {} retx deferred",
                    self.params.direction,
                    self.job.slot,
                    ue
                );
                continue;
            }
            let Some((pid, ctx)) = harq.pending_retx(ue) else {
                continue;
            };
            let ctx = ctx.clone();

            let csi = ues.get(&ue).map(|s| (s.csi(self.params.direction), s.rank(self.params.direction)));
            let plan = match csi {
                Some((csi, rank)) if self.params.adaptive_retx => {
                    self.plan_adaptive(&ctx, csi, rank)
                }
                _ => self.plan_non_adaptive(&ctx),
            };
            let Some(plan) = plan else {
                log_checks!(
                    self.params.verbosity,
                    "  UE {} pid {}: no room for {} bits, context kept",
                    ue,
                    pid,
                    ctx.tbs_bits
                );
                continue;
            };

            let snapshot = TxSnapshot {
                allocation: plan.allocation.clone(),
                start_symbol: self.job.target.start_symbol,
                num_symbols: self.job.target.num_symbols,
                mcs: plan.mcs,
                layers: plan.layers,
                precoder: plan.precoder,
                tbs_bits: ctx.tbs_bits,
            };
            let rv = match harq.advance_on_tx(ue, pid, snapshot) {
                Ok(rv) => rv,
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "retx for UE {} skipped: {}", ue, e);
                    continue;
                }
            };
            let ndi = harq.process(ue, pid).map(|p| p.ndi).unwrap_or(false);

            if plan.forced {
                stats.forced_retx += 1;
            }
            stats.retx_grants += 1;
            self.mark_used(&plan.allocation);
            self.retx_served.insert(ue);

            let mut grant = self.grant(ue, TxKind::ReTx, pid, plan.allocation);
            grant.mcs = plan.mcs;
            grant.ndi = ndi;
            grant.layers = plan.layers;
            grant.rv = rv;
            grant.precoder = plan.precoder;
            grant.tbs_bits = ctx.tbs_bits;
            log_changes!(
                self.params.verbosity,
                "  {:?} ReTx UE {} pid {} rv {} mcs {}{} in slot {}",
                self.params.direction,
                ue,
                pid,
                rv,
                plan.mcs,
                if plan.forced { " (forced)" } else { "" },
                self.job.slot
            );
            self.grants.push(grant);
        }
    }

    /// Same MCS, rank and precoder; only the resources are re-derived.
    fn plan_non_adaptive(&self, ctx: &TxSnapshot) -> Option<RetxPlan> {
        let allocation = match self.params.allocation_type {
            AllocationType::Rat0 => {
                Allocation::RbgBitmap(self.refit_rbgs(ctx)?)
            }
            AllocationType::Rat1 => {
                let (start, len) = self.refit_range(ctx)?;
                Allocation::RbRange { start, len }
            }
        };
        Some(RetxPlan {
            allocation,
            mcs: ctx.mcs,
            layers: ctx.layers,
            precoder: ctx.precoder,
            forced: false,
        })
    }

    /// Free original RBGs first, then the lowest free ones, until the block
    /// fits at the original MCS.
    fn refit_rbgs(&self, ctx: &TxSnapshot) -> Option<ResourceMask> {
        let free = self.free_mask();
        let fits = |mask: &ResourceMask| {
            self.capacity(ctx.layers, ctx.mcs, self.rbg_mask_rbs(mask)) >= ctx.tbs_bits
        };

        let mut chosen = ResourceMask::new(free.len());
        if let Allocation::RbgBitmap(original) = &ctx.allocation {
            for rbg in original.iter_set().filter(|g| *g < free.len() && free.get(*g)) {
                chosen.set(rbg);
            }
        }
        if !chosen.none() && fits(&chosen) {
            return Some(chosen);
        }
        for rbg in free.iter_set() {
            if chosen.get(rbg) {
                continue;
            }
            chosen.set(rbg);
            if fits(&chosen) {
                return Some(chosen);
            }
        }
        None
    }

    /// Original start if the needed run is still free there, otherwise the
    /// first free run long enough.
    fn refit_range(&self, ctx: &TxSnapshot) -> Option<(u16, u16)> {
        let needed = rbs_for_bits(
            self.oracle,
            &self.request(ctx.layers, ctx.mcs, 0),
            ctx.tbs_bits,
            self.params.num_rbs,
        )?;
        let free = self.free_mask();
        if let Allocation::RbRange { start, .. } = ctx.allocation {
            if start + needed <= free.len() && free.all_set(start, needed) {
                return Some((start, needed));
            }
        }
        free.runs()
            .into_iter()
            .find(|(_, len)| *len >= needed)
            .map(|(start, _)| (start, needed))
    }

    /// Link adaptation from the current report. Best resources first until
    /// the block fits at the channel MCS, then again at the last-known MCS.
    /// Only when everything free at the last-known MCS is still too small is
    /// the retransmission forced onto all free resources.
    fn plan_adaptive(&self, ctx: &TxSnapshot, csi: &CsiMeasurement, rank: u8) -> Option<RetxPlan> {
        let plan = match self.params.allocation_type {
            AllocationType::Rat0 => self.adapt_rbgs(ctx, csi, rank),
            AllocationType::Rat1 => self.adapt_range(ctx, csi, rank),
        }?;
        Some(RetxPlan {
            precoder: csi.precoder,
            ..plan
        })
    }

    fn adapt_rbgs(&self, ctx: &TxSnapshot, csi: &CsiMeasurement, rank: u8) -> Option<RetxPlan> {
        let p = self.params;
        let free = self.free_mask();
        if free.none() {
            return None;
        }
        let mut rbgs: Vec<u16> = free.iter_set().collect();
        // Stable: equal CQI keeps ascending RBG order
        rbgs.sort_by_key(|g| Reverse(csi.rbg_cqi(*g, p.rbg_size, p.num_rbs)));
        let rbg_mcs: Vec<u8> = rbgs
            .iter()
            .map(|g| csi.rbg_mcs(*g, p.rbg_size, p.num_rbs, 0, p.max_mcs).unwrap_or(0))
            .collect();
        let plan = |chosen: ResourceMask, mcs: u8, forced: bool| RetxPlan {
            allocation: Allocation::RbgBitmap(chosen),
            mcs,
            layers: rank,
            precoder: 0,
            forced,
        };

        let mut chosen = ResourceMask::new(free.len());
        for (i, rbg) in rbgs.iter().enumerate() {
            chosen.set(*rbg);
            let mcs = average_mcs(&rbg_mcs[..=i]);
            if self.capacity(rank, mcs, self.rbg_mask_rbs(&chosen)) >= ctx.tbs_bits {
                return Some(plan(chosen, mcs, false));
            }
        }

        let last_mcs = ctx.mcs.min(p.max_mcs);
        let mut chosen = ResourceMask::new(free.len());
        for rbg in &rbgs {
            chosen.set(*rbg);
            if self.capacity(rank, last_mcs, self.rbg_mask_rbs(&chosen)) >= ctx.tbs_bits {
                return Some(plan(chosen, last_mcs, false));
            }
        }

        let mcs = average_mcs(&rbg_mcs).max(ctx.mcs).min(p.max_mcs);
        Some(plan(chosen, mcs, true))
    }

    fn adapt_range(&self, ctx: &TxSnapshot, csi: &CsiMeasurement, rank: u8) -> Option<RetxPlan> {
        let p = self.params;
        let (start, run) = self.free_mask().longest_run()?;
        let plan = |len: u16, mcs: u8, forced: bool| RetxPlan {
            allocation: Allocation::RbRange { start, len },
            mcs,
            layers: rank,
            precoder: 0,
            forced,
        };

        for len in 1..=run {
            let mcs = csi.range_mcs(start, len, p.max_mcs).unwrap_or(0);
            if self.capacity(rank, mcs, len) >= ctx.tbs_bits {
                return Some(plan(len, mcs, false));
            }
        }

        let last_mcs = ctx.mcs.min(p.max_mcs);
        let template = self.request(rank, last_mcs, 0);
        if let Some(len) = rbs_for_bits(self.oracle, &template, ctx.tbs_bits, run) {
            return Some(plan(len, last_mcs, false));
        }

        let mcs = csi
            .range_mcs(start, run, p.max_mcs)
            .unwrap_or(0)
            .max(ctx.mcs)
            .min(p.max_mcs);
        Some(plan(run, mcs, true))
    }
}
