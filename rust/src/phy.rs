//! Link-adaptation tables and the transport-block capacity oracle.
//!
//! The scheduler never derives transport-block sizes itself. It asks a
//! [`CapacityOracle`] how many payload bits fit into a candidate allocation and
//! relies only on the result being monotonic in the RB count, layers and MCS.

use crate::models::{Direction, MappingType, SYMBOLS_PER_SLOT};

/// Highest index of the 64QAM MCS table.
pub const MAX_MCS: u8 = 28;

/// Highest CQI index.
pub const MAX_CQI: u8 = 15;

/// Subcarriers per RB.
const SUBCARRIERS_PER_RB: u32 = 12;

/// Modulation order and target code rate (x1024) of one MCS index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct McsEntry {
    pub modulation_order: u8,
    pub code_rate_x1024: u16,
}

impl McsEntry {
    /// Spectral efficiency in bits per resource element.
    pub fn efficiency(&self) -> f64 {
        self.modulation_order as f64 * self.code_rate_x1024 as f64 / 1024.0
    }
}

const fn entry(modulation_order: u8, code_rate_x1024: u16) -> McsEntry {
    McsEntry {
        modulation_order,
        code_rate_x1024,
    }
}

static MCS_TABLE: [McsEntry; 29] = [
    entry(2, 120),
    entry(2, 157),
    entry(2, 193),
    entry(2, 251),
    entry(2, 308),
    entry(2, 379),
    entry(2, 449),
    entry(2, 526),
    entry(2, 602),
    entry(2, 679),
    entry(4, 340),
    entry(4, 378),
    entry(4, 434),
    entry(4, 490),
    entry(4, 553),
    entry(4, 616),
    entry(4, 658),
    entry(6, 438),
    entry(6, 466),
    entry(6, 517),
    entry(6, 567),
    entry(6, 616),
    entry(6, 666),
    entry(6, 719),
    entry(6, 772),
    entry(6, 822),
    entry(6, 873),
    entry(6, 910),
    entry(6, 948),
];

// Index 0 is "out of range".
static CQI_TABLE: [McsEntry; 16] = [
    entry(0, 0),
    entry(2, 78),
    entry(2, 120),
    entry(2, 193),
    entry(2, 308),
    entry(2, 449),
    entry(2, 602),
    entry(4, 378),
    entry(4, 490),
    entry(4, 616),
    entry(6, 466),
    entry(6, 567),
    entry(6, 666),
    entry(6, 772),
    entry(6, 873),
    entry(6, 948),
];

/// Modulation/coding of an MCS index, saturating at [`MAX_MCS`].
pub fn mcs_entry(mcs: u8) -> McsEntry {
    MCS_TABLE[mcs.min(MAX_MCS) as usize]
}

/// Highest MCS whose efficiency does not exceed what the CQI promises.
///
/// CQI 0 means the UE cannot be served and maps to `None`. The lowest CQIs sit
/// below MCS 0 and still map to MCS 0.
pub fn cqi_to_mcs(cqi: u8) -> Option<u8> {
    if cqi == 0 {
        return None;
    }
    let target = CQI_TABLE[cqi.min(MAX_CQI) as usize].efficiency();
    let mcs = MCS_TABLE
        .iter()
        .rposition(|e| e.efficiency() <= target)
        .unwrap_or(0);
    Some(mcs as u8)
}

/// Everything the oracle needs to size a transport block.
#[derive(Clone, Copy, Debug)]
pub struct CapacityRequest {
    pub direction: Direction,
    pub layers: u8,
    pub mapping_type: MappingType,
    pub start_symbol: u8,
    pub num_symbols: u8,
    /// RBs in the allocated set.
    pub num_rbs: u16,
    pub mcs: u8,
    /// DM-RS symbols carved out of `num_symbols`.
    pub dmrs_symbols: u8,
}

/// Achievable payload for an allocation.
///
/// Implementations must be pure and monotonic non-decreasing in `num_rbs`,
/// `num_symbols`, `layers` and `mcs`.
pub trait CapacityOracle {
    fn capacity_bits(&self, req: &CapacityRequest) -> u32;
}

/// Default oracle: resource elements times efficiency, minus a CRC.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProportionalCapacity;

impl CapacityOracle for ProportionalCapacity {
    fn capacity_bits(&self, req: &CapacityRequest) -> u32 {
        if req.num_rbs == 0 || req.layers == 0 {
            return 0;
        }
        let data_symbols = req
            .num_symbols
            .min(SYMBOLS_PER_SLOT)
            .saturating_sub(req.dmrs_symbols) as u32;
        let res = SUBCARRIERS_PER_RB * data_symbols * req.num_rbs as u32;
        let e = mcs_entry(req.mcs);
        let raw = res as u64
            * e.modulation_order as u64
            * e.code_rate_x1024 as u64
            * req.layers as u64
            / 1024;
        // 24-bit TB CRC, byte aligned
        let payload = raw.saturating_sub(24) / 8 * 8;
        payload.min(u32::MAX as u64) as u32
    }
}

/// Smallest RB count in `1..=max_rbs` that carries `bits`, if any does.
pub fn rbs_for_bits(
    oracle: &dyn CapacityOracle,
    template: &CapacityRequest,
    bits: u32,
    max_rbs: u16,
) -> Option<u16> {
    if max_rbs == 0 {
        return None;
    }
    let fits = |rbs: u16| {
        let req = CapacityRequest {
            num_rbs: rbs,
            ..*template
        };
        oracle.capacity_bits(&req) >= bits
    };
    if !fits(max_rbs) {
        return None;
    }
    // Monotonic oracle: binary search the first fitting count.
    let (mut lo, mut hi) = (1u16, max_rbs);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if fits(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Some(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(num_rbs: u16, mcs: u8) -> CapacityRequest {
        CapacityRequest {
            direction: Direction::Downlink,
            layers: 1,
            mapping_type: MappingType::TypeA,
            start_symbol: 1,
            num_symbols: 13,
            num_rbs,
            mcs,
            dmrs_symbols: 1,
        }
    }

    #[test]
    fn test_cqi_to_mcs_mapping() {
        assert_eq!(cqi_to_mcs(0), None);
        assert_eq!(cqi_to_mcs(1), Some(0));
        assert_eq!(cqi_to_mcs(15), Some(MAX_MCS));
        // CQI 7 (16QAM 378) matches MCS 11 exactly
        assert_eq!(cqi_to_mcs(7), Some(11));
        // CQI 10 (64QAM 466) matches MCS 18
        assert_eq!(cqi_to_mcs(10), Some(18));
        // Monotonic in CQI
        let mut last = 0;
        for cqi in 1..=MAX_CQI {
            let mcs = cqi_to_mcs(cqi).unwrap();
            assert!(mcs >= last);
            last = mcs;
        }
    }

    #[test]
    fn test_proportional_capacity_monotonic() {
        let oracle = ProportionalCapacity;
        let mut last = 0;
        for rbs in 1..=50 {
            let bits = oracle.capacity_bits(&request(rbs, 10));
            assert!(bits >= last);
            last = bits;
        }
        assert!(
            oracle.capacity_bits(&request(10, 20)) > oracle.capacity_bits(&request(10, 5))
        );
        assert_eq!(oracle.capacity_bits(&request(0, 20)), 0);
    }

    #[test]
    fn test_two_layers_double_the_payload() {
        let oracle = ProportionalCapacity;
        let one = oracle.capacity_bits(&request(20, 15));
        let two = oracle.capacity_bits(&CapacityRequest {
            layers: 2,
            ..request(20, 15)
        });
        assert!(two >= 2 * one);
    }

    #[test]
    fn test_rbs_for_bits_finds_minimum() {
        let oracle = ProportionalCapacity;
        let template = request(0, 10);
        let target = oracle.capacity_bits(&request(7, 10));
        assert_eq!(rbs_for_bits(&oracle, &template, target, 50), Some(7));
        assert_eq!(rbs_for_bits(&oracle, &template, target + 1, 50), Some(8));
        assert_eq!(rbs_for_bits(&oracle, &template, u32::MAX, 50), None);
    }
}
