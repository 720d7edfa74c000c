//! Core data types shared by every scheduler component.

use pyo3::prelude::*;

use crate::mask::ResourceMask;

/// Radio identifier of a connected UE (RNTI).
pub type UeId = u16;

/// HARQ process index within a UE.
pub type HarqId = u8;

/// OFDM symbols in one slot (normal cyclic prefix).
pub const SYMBOLS_PER_SLOT: u8 = 14;

/// Link direction.
#[pyclass(eq, eq_int)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Downlink,
    Uplink,
}

impl Direction {
    /// Index into per-direction arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::Downlink => 0,
            Direction::Uplink => 1,
        }
    }
}

/// Whether a grant carries a fresh transport block or repeats a failed one.
#[pyclass(eq, eq_int)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxKind {
    NewTx,
    ReTx,
}

/// PDSCH/PUSCH time-domain mapping type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingType {
    /// Slot-based; DM-RS anchored to the slot.
    TypeA,
    /// Mini-slot; needs at least two symbols.
    TypeB,
}

/// Timing passed in by the MAC driver on every invocation.
#[pyclass]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TimingInfo {
    #[pyo3(get, set)]
    pub frame: u32,
    #[pyo3(get, set)]
    pub slot: u32,
    #[pyo3(get, set)]
    pub symbol: u8,
}

#[pymethods]
impl TimingInfo {
    #[new]
    #[pyo3(signature = (frame, slot, symbol=0))]
    fn py_new(frame: u32, slot: u32, symbol: u8) -> Self {
        Self {
            frame,
            slot,
            symbol,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "TimingInfo(frame={}, slot={}, symbol={})",
            self.frame, self.slot, self.symbol
        )
    }
}

impl TimingInfo {
    pub fn new(frame: u32, slot: u32, symbol: u8) -> Self {
        Self {
            frame,
            slot,
            symbol,
        }
    }

    /// Absolute slot counter for this timing.
    pub fn slot_point(&self, slots_per_frame: u32) -> SlotPoint {
        SlotPoint(self.frame as u64 * slots_per_frame as u64 + self.slot as u64)
    }
}

/// Absolute slot counter since frame 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SlotPoint(pub u64);

impl SlotPoint {
    #[inline]
    pub fn plus(self, slots: u64) -> Self {
        SlotPoint(self.0 + slots)
    }

    /// Slots from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    pub fn since(self, earlier: SlotPoint) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Absolute symbol index of the given symbol of this slot.
    #[inline]
    pub fn symbol(self, symbol: u8) -> u64 {
        self.0 * SYMBOLS_PER_SLOT as u64 + symbol as u64
    }

    /// Split back into (frame, slot).
    pub fn to_frame_slot(self, slots_per_frame: u32) -> (u32, u32) {
        let spf = slots_per_frame as u64;
        ((self.0 / spf) as u32, (self.0 % spf) as u32)
    }
}

/// Frequency-domain allocation of a grant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// RAT-0: one bit per RBG.
    RbgBitmap(ResourceMask),
    /// RAT-1: contiguous run of RBs.
    RbRange { start: u16, len: u16 },
}

impl Allocation {
    /// Number of RBs covered, given the RBG geometry for RAT-0.
    pub fn num_rbs(&self, rbg_size: u16, num_rbs: u16) -> u16 {
        match self {
            Allocation::RbgBitmap(mask) => mask
                .iter_set()
                .map(|rbg| rbg_width(rbg, rbg_size, num_rbs))
                .sum(),
            Allocation::RbRange { len, .. } => *len,
        }
    }
}

/// Width in RBs of RBG `rbg`; the last group of the carrier may be short.
#[inline]
pub fn rbg_width(rbg: u16, rbg_size: u16, num_rbs: u16) -> u16 {
    let start = rbg * rbg_size;
    rbg_size.min(num_rbs.saturating_sub(start))
}

/// Number of RBGs needed to cover `num_rbs`.
#[inline]
pub fn rbg_count(num_rbs: u16, rbg_size: u16) -> u16 {
    num_rbs.div_ceil(rbg_size)
}

/// A scheduling decision for one UE in one slot.
#[pyclass]
#[derive(Clone, Debug, PartialEq)]
pub struct Grant {
    #[pyo3(get)]
    pub ue: UeId,
    #[pyo3(get)]
    pub direction: Direction,
    #[pyo3(get)]
    pub kind: TxKind,
    #[pyo3(get)]
    pub harq_id: HarqId,
    pub allocation: Allocation,
    /// Absolute frame of the slot the grant applies to.
    #[pyo3(get)]
    pub frame: u32,
    /// Slot within `frame`.
    #[pyo3(get)]
    pub slot: u32,
    /// K0 (DL) / K2 (UL): slots between the scheduling slot and the data slot.
    #[pyo3(get)]
    pub slot_offset: u8,
    #[pyo3(get)]
    pub start_symbol: u8,
    #[pyo3(get)]
    pub num_symbols: u8,
    #[pyo3(get)]
    pub mcs: u8,
    #[pyo3(get)]
    pub ndi: bool,
    #[pyo3(get)]
    pub layers: u8,
    #[pyo3(get)]
    pub rv: u8,
    /// Precoder (PMI in DL, TPMI in UL).
    #[pyo3(get)]
    pub precoder: u16,
    #[pyo3(get)]
    pub tbs_bits: u32,
    /// K1: slots from data to HARQ-ACK. Downlink only.
    #[pyo3(get)]
    pub feedback_offset: Option<u8>,
}

#[pymethods]
impl Grant {
    /// RBG bitmap for RAT-0 grants.
    fn rbg_bitmap(&self) -> Option<Vec<bool>> {
        match &self.allocation {
            Allocation::RbgBitmap(mask) => Some(mask.to_vec()),
            Allocation::RbRange { .. } => None,
        }
    }

    /// (start, length) for RAT-1 grants.
    fn rb_range(&self) -> Option<(u16, u16)> {
        match self.allocation {
            Allocation::RbRange { start, len } => Some((start, len)),
            Allocation::RbgBitmap(_) => None,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "Grant(ue={}, {:?}, {:?}, harq={}, mcs={}, rv={}, tbs={})",
            self.ue, self.direction, self.kind, self.harq_id, self.mcs, self.rv, self.tbs_bits
        )
    }
}
