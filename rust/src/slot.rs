//! Duplex-aware slot selection.
//!
//! Decides, at each scheduler invocation, which upcoming slots have to be
//! scheduled now. FDD is periodic. TDD schedules exactly one DL slot per
//! invocation and every UL slot whose grant could not arrive in time if it
//! waited for the next DL-bearing slot.

use crate::config::Duplex;
use crate::models::{Direction, SlotPoint, SYMBOLS_PER_SLOT};
use crate::{log_checks, log_debug};

/// Direction of one OFDM symbol in a TDD slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Dl,
    Ul,
    /// Guard or flexible; carries no data.
    Guard,
}

/// K0/K2 of `slot` seen from `now`. Config validation bounds UL preparation
/// and period lengths so this stays within a u8.
fn slot_offset(slot: SlotPoint, now: SlotPoint) -> u8 {
    let offset = slot.since(now);
    debug_assert!(offset <= u8::MAX as u64, "slot offset {} overflows", offset);
    offset.min(u8::MAX as u64) as u8
}

/// Per-symbol layout of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotFormat {
    symbols: [SymbolKind; SYMBOLS_PER_SLOT as usize],
}

impl SlotFormat {
    pub fn downlink() -> Self {
        Self {
            symbols: [SymbolKind::Dl; SYMBOLS_PER_SLOT as usize],
        }
    }

    pub fn uplink() -> Self {
        Self {
            symbols: [SymbolKind::Ul; SYMBOLS_PER_SLOT as usize],
        }
    }

    pub fn flexible() -> Self {
        Self {
            symbols: [SymbolKind::Guard; SYMBOLS_PER_SLOT as usize],
        }
    }

    /// `dl` DL symbols, then `guard` guard symbols, then `ul` UL symbols.
    ///
    /// Caller guarantees the three add up to a slot.
    pub fn special(dl: u8, guard: u8, ul: u8) -> Self {
        let mut symbols = [SymbolKind::Guard; SYMBOLS_PER_SLOT as usize];
        for (idx, sym) in symbols.iter_mut().enumerate() {
            let idx = idx as u8;
            *sym = if idx < dl {
                SymbolKind::Dl
            } else if idx < dl + guard {
                SymbolKind::Guard
            } else if idx < dl + guard + ul {
                SymbolKind::Ul
            } else {
                SymbolKind::Guard
            };
        }
        Self { symbols }
    }

    pub fn starts_with_dl(&self) -> bool {
        self.symbols[0] == SymbolKind::Dl
    }

    pub fn has_dl(&self) -> bool {
        self.symbols.contains(&SymbolKind::Dl)
    }

    pub fn has_ul(&self) -> bool {
        self.symbols.contains(&SymbolKind::Ul)
    }

    pub fn first_ul_symbol(&self) -> Option<u8> {
        self.first(SymbolKind::Ul)
    }

    /// Usable DL data symbols as `(start, count)` after the control region.
    pub fn dl_span(&self, ctrl_symbols: u8) -> Option<(u8, u8)> {
        let (start, count) = self.span(SymbolKind::Dl)?;
        Some((start + ctrl_symbols, count.saturating_sub(ctrl_symbols)))
    }

    /// Usable UL data symbols as `(start, count)`; reserved symbols come off
    /// the tail and may leave nothing.
    pub fn ul_span(&self, reserved_symbols: u8) -> Option<(u8, u8)> {
        let (start, count) = self.span(SymbolKind::Ul)?;
        Some((start, count.saturating_sub(reserved_symbols)))
    }

    fn first(&self, kind: SymbolKind) -> Option<u8> {
        self.symbols.iter().position(|s| *s == kind).map(|p| p as u8)
    }

    fn span(&self, kind: SymbolKind) -> Option<(u8, u8)> {
        let start = self.first(kind)?;
        let count = self.symbols[start as usize..]
            .iter()
            .take_while(|s| **s == kind)
            .count() as u8;
        Some((start, count))
    }
}

/// Repeating sequence of slot formats.
#[derive(Clone, Debug, PartialEq)]
pub struct TddPattern {
    slots: Vec<SlotFormat>,
}

impl TddPattern {
    /// Caller guarantees `slots` is non-empty.
    pub fn new(slots: Vec<SlotFormat>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[SlotFormat] {
        &self.slots
    }

    /// Format of absolute slot `slot`.
    pub fn slot(&self, slot: u64) -> &SlotFormat {
        &self.slots[(slot % self.slots.len() as u64) as usize]
    }

    fn format_at(&self, slot: SlotPoint) -> &SlotFormat {
        self.slot(slot.0)
    }

    /// First slot strictly after `now` that begins with a DL symbol.
    fn next_dl_start(&self, now: SlotPoint) -> SlotPoint {
        (1..=self.slots.len() as u64)
            .map(|k| now.plus(k))
            .find(|s| self.format_at(*s).starts_with_dl())
            .unwrap_or(now.plus(self.slots.len() as u64))
    }
}

/// A slot chosen for scheduling, with its usable symbol window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotTarget {
    pub slot: SlotPoint,
    /// Slots between the invocation slot and `slot` (K0 / K2).
    pub offset: u8,
    pub start_symbol: u8,
    /// May be zero when reserved symbols eat the whole span.
    pub num_symbols: u8,
}

/// Timing parameters the selector needs.
#[derive(Clone, Copy, Debug)]
pub struct SlotTiming {
    pub fdd_periodicity: u8,
    pub ul_prep_symbols: u16,
    pub dl_ctrl_symbols: u8,
    pub ul_reserved_symbols: u8,
    pub harq_feedback_min_slots: u8,
}

/// Chooses which slots to schedule at each invocation.
#[derive(Clone, Debug)]
pub struct SlotSelector {
    duplex: Duplex,
    timing: SlotTiming,
    /// FDD: invocations until the next batch, per direction.
    fdd_countdown: [u8; 2],
    /// Latest slot already handed out, per direction.
    last_scheduled: [Option<SlotPoint>; 2],
    verbosity: u8,
}

impl SlotSelector {
    pub fn new(duplex: Duplex, timing: SlotTiming, verbosity: u8) -> Self {
        Self {
            duplex,
            timing,
            fdd_countdown: [0; 2],
            last_scheduled: [None; 2],
            verbosity,
        }
    }

    /// Slots to schedule for `direction` when invoked at the start of `now`.
    pub fn select(&mut self, direction: Direction, now: SlotPoint) -> Vec<SlotTarget> {
        let targets = match self.duplex {
            Duplex::Fdd => self.select_fdd(direction, now),
            Duplex::Tdd(_) => self.select_tdd(direction, now),
        };
        if let Some(last) = targets.last() {
            self.last_scheduled[direction.index()] = Some(last.slot);
        }
        targets
    }

    /// K1 for DL data in `slot`: the first UL-bearing slot at or after the
    /// configured minimum.
    pub fn feedback_offset(&self, slot: SlotPoint) -> u8 {
        let min = self.timing.harq_feedback_min_slots;
        match &self.duplex {
            Duplex::Fdd => min,
            Duplex::Tdd(pattern) => (min as u64..min as u64 + pattern.len() as u64)
                .find(|k| pattern.format_at(slot.plus(*k)).has_ul())
                .map(|k| k as u8)
                .unwrap_or(min),
        }
    }

    fn not_yet_scheduled(&self, direction: Direction, slot: SlotPoint) -> bool {
        self.last_scheduled[direction.index()]
            .map_or(true, |last| slot > last)
    }

    /// Slots to move UL scheduling ahead so the UE has its preparation time.
    fn fdd_ul_offset(&self) -> u64 {
        (self.timing.ul_prep_symbols as u64)
            .div_ceil(SYMBOLS_PER_SLOT as u64)
            .max(1)
    }

    fn select_fdd(&mut self, direction: Direction, now: SlotPoint) -> Vec<SlotTarget> {
        let countdown = &mut self.fdd_countdown[direction.index()];
        if *countdown > 0 {
            *countdown -= 1;
            return Vec::new();
        }
        let periodicity = self.timing.fdd_periodicity;
        *countdown = periodicity - 1;

        let (base, start_symbol, num_symbols) = match direction {
            Direction::Downlink => (
                now,
                self.timing.dl_ctrl_symbols,
                SYMBOLS_PER_SLOT - self.timing.dl_ctrl_symbols,
            ),
            Direction::Uplink => (
                now.plus(self.fdd_ul_offset()),
                0,
                SYMBOLS_PER_SLOT - self.timing.ul_reserved_symbols,
            ),
        };

        let targets: Vec<SlotTarget> = (0..periodicity as u64)
            .map(|k| base.plus(k))
            .filter(|slot| self.not_yet_scheduled(direction, *slot))
            .map(|slot| SlotTarget {
                slot,
                offset: slot_offset(slot, now),
                start_symbol,
                num_symbols,
            })
            .collect();
        log_checks!(
            self.verbosity,
            "  FDD {:?} batch at slot {}: {} slots",
            direction,
            now.0,
            targets.len()
        );
        targets
    }

    fn select_tdd(&self, direction: Direction, now: SlotPoint) -> Vec<SlotTarget> {
        let Duplex::Tdd(pattern) = &self.duplex else {
            return Vec::new();
        };
        if !pattern.format_at(now).starts_with_dl() {
            log_debug!(
                self.verbosity,
                "  slot {} does not start with DL, nothing selected",
                now.0
            );
            return Vec::new();
        }
        match direction {
            Direction::Downlink => self.select_tdd_dl(pattern, now),
            Direction::Uplink => self.select_tdd_ul(pattern, now),
        }
    }

    fn select_tdd_dl(&self, pattern: &TddPattern, now: SlotPoint) -> Vec<SlotTarget> {
        let next_opportunity = pattern.next_dl_start(now);
        let mut slot = match self.last_scheduled[Direction::Downlink.index()] {
            Some(last) if last >= now => last.plus(1),
            _ => now,
        };
        while slot < next_opportunity {
            let format = pattern.format_at(slot);
            if let Some((start_symbol, num_symbols)) = format.dl_span(self.timing.dl_ctrl_symbols)
            {
                return vec![SlotTarget {
                    slot,
                    offset: slot_offset(slot, now),
                    start_symbol,
                    num_symbols,
                }];
            }
            slot = slot.plus(1);
        }
        Vec::new()
    }

    fn select_tdd_ul(&self, pattern: &TddPattern, now: SlotPoint) -> Vec<SlotTarget> {
        let prep = self.timing.ul_prep_symbols as u64;
        let now_symbol = now.symbol(0);
        let deferred_symbol = pattern.next_dl_start(now).symbol(0);

        let mut slot = match self.last_scheduled[Direction::Uplink.index()] {
            Some(last) if last >= now => last.plus(1),
            _ => now,
        };
        let horizon = now.plus(2 * pattern.len() as u64 + prep.div_ceil(SYMBOLS_PER_SLOT as u64));
        let mut targets = Vec::new();

        while slot < horizon {
            let format = pattern.format_at(slot);
            let Some(first_ul) = format.first_ul_symbol() else {
                slot = slot.plus(1);
                continue;
            };
            let ul_symbol = slot.symbol(first_ul);
            if ul_symbol < now_symbol + prep {
                // Already inside the preparation window; no grant can make it.
                log_checks!(
                    self.verbosity,
                    "  UL slot {} unreachable from slot {} (prep {} symbols)",
                    slot.0,
                    now.0,
                    prep
                );
                slot = slot.plus(1);
                continue;
            }
            if ul_symbol >= deferred_symbol + prep {
                // The next DL opportunity is still early enough.
                break;
            }
            let (start_symbol, num_symbols) = format
                .ul_span(self.timing.ul_reserved_symbols)
                .unwrap_or((first_ul, 0));
            targets.push(SlotTarget {
                slot,
                offset: slot_offset(slot, now),
                start_symbol,
                num_symbols,
            });
            slot = slot.plus(1);
        }
        targets
    }
}
