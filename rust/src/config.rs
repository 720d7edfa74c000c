//! Configuration types for the MAC scheduler.
//!
//! [`SchedulerConfig`] is the flat, Python-friendly form. Its string fields are
//! parsed once by [`SchedulerConfig::validate`] into a typed [`CellLayout`];
//! nothing downstream looks at the strings again.

use pyo3::prelude::*;
use thiserror::Error;

use crate::mask::MAX_RESOURCES;
use crate::models::{rbg_count, MappingType, SYMBOLS_PER_SLOT};
use crate::phy::{MAX_CQI, MAX_MCS};
use crate::slot::{SlotFormat, TddPattern};

/// Largest carrier the scheduler accepts, in RBs.
pub const MAX_BANDWIDTH_RBS: u16 = 275;
/// Longest UL preparation time: 32 slots, the K2 range.
pub const MAX_UL_PREP_SYMBOLS: u16 = 32 * SYMBOLS_PER_SLOT as u16;
/// Longest FDD batch and longest TDD pattern, in slots.
pub const MAX_PERIOD_SLOTS: usize = 80;

/// Malformed construction parameters. Raised only at setup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("numerology {0} out of range (0-4)")]
    Numerology(u8),
    #[error("unknown duplex mode: {0}")]
    UnknownDuplex(String),
    #[error("invalid TDD pattern {pattern:?}: {reason}")]
    TddPattern { pattern: String, reason: String },
    #[error("bandwidth of {0} RBs out of range (1-275)")]
    Bandwidth(u16),
    #[error("RBG size {0} not one of 1, 2, 4, 8, 16")]
    RbgSize(u16),
    #[error("unknown allocation type: {0}")]
    UnknownAllocationType(String),
    #[error("unknown scheduling strategy: {0}")]
    UnknownStrategy(String),
    #[error("HARQ process count {0} out of range (1-16)")]
    HarqProcesses(u8),
    #[error("invalid redundancy version sequence: {0:?}")]
    RvSequence(Vec<u8>),
    #[error("FDD periodicity {0} out of range (1-80 slots)")]
    Periodicity(u8),
    #[error("UL preparation of {0} symbols above {max}", max = MAX_UL_PREP_SYMBOLS)]
    UlPrep(u16),
    #[error("unknown mapping type: {0}")]
    UnknownMappingType(String),
    #[error("unsupported DM-RS configuration: {0}")]
    Dmrs(String),
    #[error("per-UE RB limit {limit} out of range (1-{bandwidth})")]
    RbLimit { limit: u16, bandwidth: u16 },
    #[error("MCS cap {0} above table maximum")]
    McsCap(u8),
    #[error("symbol layout leaves no usable symbols: {0}")]
    Symbols(String),
    #[error("invalid MU-MIMO parameter: {0}")]
    MuMimo(String),
}

/// Frequency-domain resource allocation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationType {
    /// RAT-0: bitmap over RBGs.
    Rat0,
    /// RAT-1: contiguous RB range.
    Rat1,
}

/// Which new-transmission strategy the engine is built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
}

/// Duplexing scheme of the cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Duplex {
    Fdd,
    Tdd(TddPattern),
}

/// Validated, typed view of the configuration.
#[derive(Clone, Debug)]
pub struct CellLayout {
    pub slots_per_frame: u32,
    pub duplex: Duplex,
    pub allocation_type: AllocationType,
    pub strategy: StrategyKind,
    pub mapping_type: MappingType,
    pub dl_rbs: u16,
    pub ul_rbs: u16,
    pub rbg_size: u16,
    pub dl_rbgs: u16,
    pub ul_rbgs: u16,
}

/// Scheduler configuration.
#[pyclass]
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Subcarrier spacing index; 10 * 2^numerology slots per frame.
    #[pyo3(get, set)]
    pub numerology: u8,
    /// "fdd" or "tdd"
    #[pyo3(get, set)]
    pub duplex: String,
    /// Slot types separated by '|': DL, UL, S (special) or F (flexible)
    #[pyo3(get, set)]
    pub tdd_pattern: String,
    /// DL symbols at the start of a special slot
    #[pyo3(get, set)]
    pub special_dl_symbols: u8,
    /// Guard symbols in a special slot
    #[pyo3(get, set)]
    pub special_guard_symbols: u8,
    /// UL symbols at the end of a special slot
    #[pyo3(get, set)]
    pub special_ul_symbols: u8,
    #[pyo3(get, set)]
    pub dl_bandwidth_rbs: u16,
    #[pyo3(get, set)]
    pub ul_bandwidth_rbs: u16,
    #[pyo3(get, set)]
    pub rbg_size: u16,
    /// "rat0" (RBG bitmap) or "rat1" (contiguous RBs)
    #[pyo3(get, set)]
    pub allocation_type: String,
    /// New-transmission strategy: "round_robin"
    #[pyo3(get, set)]
    pub strategy: String,
    #[pyo3(get, set)]
    pub num_harq_processes: u8,
    /// Redundancy versions in transmission order
    #[pyo3(get, set)]
    pub rv_sequence: Vec<u8>,
    /// FDD: slots scheduled per batch
    #[pyo3(get, set)]
    pub fdd_periodicity_slots: u8,
    /// Symbols a UE needs between receiving a UL grant and transmitting
    #[pyo3(get, set)]
    pub ul_prep_symbols: u16,
    /// Leading DL symbols reserved for PDCCH
    #[pyo3(get, set)]
    pub dl_ctrl_symbols: u8,
    /// Trailing UL symbols reserved for SRS
    #[pyo3(get, set)]
    pub ul_reserved_symbols: u8,
    #[pyo3(get, set)]
    pub dmrs_symbols: u8,
    /// "A" (slot-based) or "B" (mini-slot)
    #[pyo3(get, set)]
    pub mapping_type: String,
    /// Per-UE RB ceiling for new transmissions (None = bandwidth)
    #[pyo3(get, set)]
    pub max_rb_per_ue: Option<u16>,
    #[pyo3(get, set)]
    pub max_mcs: u8,
    /// Re-run link adaptation on retransmissions
    #[pyo3(get, set)]
    pub adaptive_retx: bool,
    /// Minimum K1 (DL data to HARQ-ACK), in slots
    #[pyo3(get, set)]
    pub harq_feedback_min_slots: u8,
    #[pyo3(get, set)]
    pub mu_mimo_enabled: bool,
    /// Minimum RB requirement for a UE to be considered for pairing
    #[pyo3(get, set)]
    pub mu_min_rbs: u16,
    /// Minimum wideband CQI for a UE to be considered for pairing
    #[pyo3(get, set)]
    pub mu_min_cqi: u8,
    /// Maximum normalized precoder correlation for a pair (0-1)
    #[pyo3(get, set)]
    pub mu_semi_orthogonality: f64,
    /// CQI steps lost when a UE shares its RBs with a partner
    #[pyo3(get, set)]
    pub mu_cqi_backoff: u8,
    /// Seed for the retransmission visiting order
    #[pyo3(get, set)]
    pub random_seed: u64,
    /// Verbosity level: 0=silent, 1=changes, 2=checks, 3=debug.
    #[pyo3(get, set)]
    pub verbosity: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            numerology: 0,
            duplex: "fdd".to_string(),
            tdd_pattern: "DL|DL|DL|S|UL".to_string(),
            special_dl_symbols: 10,
            special_guard_symbols: 2,
            special_ul_symbols: 2,
            dl_bandwidth_rbs: 52,
            ul_bandwidth_rbs: 52,
            rbg_size: 4,
            allocation_type: "rat0".to_string(),
            strategy: "round_robin".to_string(),
            num_harq_processes: 16,
            rv_sequence: vec![0, 2, 3, 1],
            fdd_periodicity_slots: 1,
            ul_prep_symbols: 14,
            dl_ctrl_symbols: 1,
            ul_reserved_symbols: 0,
            dmrs_symbols: 1,
            mapping_type: "A".to_string(),
            max_rb_per_ue: None,
            max_mcs: MAX_MCS,
            adaptive_retx: false,
            harq_feedback_min_slots: 1,
            mu_mimo_enabled: false,
            mu_min_rbs: 4,
            mu_min_cqi: 7,
            mu_semi_orthogonality: 0.3,
            mu_cqi_backoff: 2,
            random_seed: 1,
            verbosity: 0,
        }
    }
}

#[pymethods]
impl SchedulerConfig {
    #[new]
    #[pyo3(signature = (
        duplex=None,
        allocation_type=None,
        dl_bandwidth_rbs=None,
        ul_bandwidth_rbs=None,
        rbg_size=None,
        tdd_pattern=None,
        num_harq_processes=None,
        adaptive_retx=None,
        mu_mimo_enabled=None,
        random_seed=None,
        verbosity=None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn py_new(
        duplex: Option<String>,
        allocation_type: Option<String>,
        dl_bandwidth_rbs: Option<u16>,
        ul_bandwidth_rbs: Option<u16>,
        rbg_size: Option<u16>,
        tdd_pattern: Option<String>,
        num_harq_processes: Option<u8>,
        adaptive_retx: Option<bool>,
        mu_mimo_enabled: Option<bool>,
        random_seed: Option<u64>,
        verbosity: Option<u8>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            duplex: duplex.unwrap_or(defaults.duplex),
            allocation_type: allocation_type.unwrap_or(defaults.allocation_type),
            dl_bandwidth_rbs: dl_bandwidth_rbs.unwrap_or(defaults.dl_bandwidth_rbs),
            ul_bandwidth_rbs: ul_bandwidth_rbs.unwrap_or(defaults.ul_bandwidth_rbs),
            rbg_size: rbg_size.unwrap_or(defaults.rbg_size),
            tdd_pattern: tdd_pattern.unwrap_or(defaults.tdd_pattern),
            num_harq_processes: num_harq_processes.unwrap_or(defaults.num_harq_processes),
            adaptive_retx: adaptive_retx.unwrap_or(defaults.adaptive_retx),
            mu_mimo_enabled: mu_mimo_enabled.unwrap_or(defaults.mu_mimo_enabled),
            random_seed: random_seed.unwrap_or(defaults.random_seed),
            verbosity: verbosity.unwrap_or(defaults.verbosity),
            ..defaults
        }
    }

    /// Raise ValueError if the configuration is unusable.
    #[pyo3(name = "validate")]
    fn py_validate(&self) -> PyResult<()> {
        self.validate()
            .map(|_| ())
            .map_err(|e| pyo3::exceptions::PyValueError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        format!(
            "SchedulerConfig(duplex={:?}, allocation_type={:?}, dl_rbs={}, ul_rbs={}, strategy={:?})",
            self.duplex,
            self.allocation_type,
            self.dl_bandwidth_rbs,
            self.ul_bandwidth_rbs,
            self.strategy
        )
    }
}

impl SchedulerConfig {
    /// Check every parameter and build the typed layout.
    pub fn validate(&self) -> Result<CellLayout, ConfigError> {
        if self.numerology > 4 {
            return Err(ConfigError::Numerology(self.numerology));
        }
        for rbs in [self.dl_bandwidth_rbs, self.ul_bandwidth_rbs] {
            if rbs == 0 || rbs > MAX_BANDWIDTH_RBS {
                return Err(ConfigError::Bandwidth(rbs));
            }
        }
        if ![1, 2, 4, 8, 16].contains(&self.rbg_size) {
            return Err(ConfigError::RbgSize(self.rbg_size));
        }
        if self.num_harq_processes == 0 || self.num_harq_processes > 16 {
            return Err(ConfigError::HarqProcesses(self.num_harq_processes));
        }
        if self.rv_sequence.is_empty() || self.rv_sequence.iter().any(|rv| *rv > 3) {
            return Err(ConfigError::RvSequence(self.rv_sequence.clone()));
        }
        if self.fdd_periodicity_slots == 0
            || self.fdd_periodicity_slots as usize > MAX_PERIOD_SLOTS
        {
            return Err(ConfigError::Periodicity(self.fdd_periodicity_slots));
        }
        // Slot offsets (K2) are carried in a u8
        if self.ul_prep_symbols > MAX_UL_PREP_SYMBOLS {
            return Err(ConfigError::UlPrep(self.ul_prep_symbols));
        }
        if self.max_mcs > MAX_MCS {
            return Err(ConfigError::McsCap(self.max_mcs));
        }
        if let Some(limit) = self.max_rb_per_ue {
            let bandwidth = self.dl_bandwidth_rbs.max(self.ul_bandwidth_rbs);
            if limit == 0 || limit > bandwidth {
                return Err(ConfigError::RbLimit { limit, bandwidth });
            }
        }

        let allocation_type = match self.allocation_type.to_ascii_lowercase().as_str() {
            "rat0" | "type0" => AllocationType::Rat0,
            "rat1" | "type1" => AllocationType::Rat1,
            other => return Err(ConfigError::UnknownAllocationType(other.to_string())),
        };
        let strategy = match self.strategy.as_str() {
            "round_robin" | "rr" => StrategyKind::RoundRobin,
            other => return Err(ConfigError::UnknownStrategy(other.to_string())),
        };
        let mapping_type = match self.mapping_type.as_str() {
            "A" | "a" => MappingType::TypeA,
            "B" | "b" => MappingType::TypeB,
            other => return Err(ConfigError::UnknownMappingType(other.to_string())),
        };
        self.validate_dmrs(mapping_type)?;
        self.validate_mu_mimo()?;

        let duplex = match self.duplex.to_ascii_lowercase().as_str() {
            "fdd" => Duplex::Fdd,
            "tdd" => Duplex::Tdd(self.parse_tdd_pattern()?),
            other => return Err(ConfigError::UnknownDuplex(other.to_string())),
        };
        self.validate_symbols(&duplex)?;

        // Fixed-capacity masks must hold the largest carrier
        debug_assert!(MAX_BANDWIDTH_RBS as usize <= MAX_RESOURCES);

        Ok(CellLayout {
            slots_per_frame: 10 << self.numerology,
            duplex,
            allocation_type,
            strategy,
            mapping_type,
            dl_rbs: self.dl_bandwidth_rbs,
            ul_rbs: self.ul_bandwidth_rbs,
            rbg_size: self.rbg_size,
            dl_rbgs: rbg_count(self.dl_bandwidth_rbs, self.rbg_size),
            ul_rbgs: rbg_count(self.ul_bandwidth_rbs, self.rbg_size),
        })
    }

    fn validate_dmrs(&self, mapping_type: MappingType) -> Result<(), ConfigError> {
        if self.dmrs_symbols == 0 || self.dmrs_symbols > 4 {
            return Err(ConfigError::Dmrs(format!(
                "{} DM-RS symbols (1-4 supported)",
                self.dmrs_symbols
            )));
        }
        if mapping_type == MappingType::TypeB && self.dmrs_symbols > 2 {
            return Err(ConfigError::Dmrs(format!(
                "mapping type B supports at most 2 DM-RS symbols, got {}",
                self.dmrs_symbols
            )));
        }
        if self.dl_ctrl_symbols > 3 {
            return Err(ConfigError::Symbols(format!(
                "{} PDCCH symbols (0-3 supported)",
                self.dl_ctrl_symbols
            )));
        }
        if self.ul_reserved_symbols >= SYMBOLS_PER_SLOT {
            return Err(ConfigError::Symbols(format!(
                "{} reserved UL symbols",
                self.ul_reserved_symbols
            )));
        }
        Ok(())
    }

    fn validate_mu_mimo(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.mu_semi_orthogonality) {
            return Err(ConfigError::MuMimo(format!(
                "semi-orthogonality factor {} not in [0, 1]",
                self.mu_semi_orthogonality
            )));
        }
        if self.mu_min_cqi > MAX_CQI {
            return Err(ConfigError::MuMimo(format!(
                "minimum CQI {} above {}",
                self.mu_min_cqi, MAX_CQI
            )));
        }
        Ok(())
    }

    fn parse_tdd_pattern(&self) -> Result<TddPattern, ConfigError> {
        let fail = |reason: String| ConfigError::TddPattern {
            pattern: self.tdd_pattern.clone(),
            reason,
        };
        let special_total = self.special_dl_symbols as u16
            + self.special_guard_symbols as u16
            + self.special_ul_symbols as u16;

        let mut slots = Vec::new();
        for token in self.tdd_pattern.split('|').map(|s| s.trim()) {
            let format = match token.to_ascii_uppercase().as_str() {
                "DL" | "D" => SlotFormat::downlink(),
                "UL" | "U" => SlotFormat::uplink(),
                "F" => SlotFormat::flexible(),
                "S" => {
                    if special_total != SYMBOLS_PER_SLOT as u16 {
                        return Err(fail(format!(
                            "special slot has {} symbols, expected {}",
                            special_total, SYMBOLS_PER_SLOT
                        )));
                    }
                    SlotFormat::special(
                        self.special_dl_symbols,
                        self.special_guard_symbols,
                        self.special_ul_symbols,
                    )
                }
                other => return Err(fail(format!("unknown slot type {:?}", other))),
            };
            slots.push(format);
        }

        if slots.len() > MAX_PERIOD_SLOTS {
            return Err(fail(format!(
                "{} slots, at most {} supported",
                slots.len(),
                MAX_PERIOD_SLOTS
            )));
        }
        if !slots.iter().any(|s| s.starts_with_dl()) {
            return Err(fail("no slot begins with a DL symbol".to_string()));
        }
        if !slots.iter().any(|s| s.has_ul()) {
            return Err(fail("no slot carries UL symbols".to_string()));
        }
        Ok(TddPattern::new(slots))
    }

    fn validate_symbols(&self, duplex: &Duplex) -> Result<(), ConfigError> {
        let min_symbols = self.dmrs_symbols + 1;
        let (dl_ok, ul_ok) = match duplex {
            Duplex::Fdd => (
                SYMBOLS_PER_SLOT - self.dl_ctrl_symbols >= min_symbols,
                SYMBOLS_PER_SLOT - self.ul_reserved_symbols >= min_symbols,
            ),
            Duplex::Tdd(pattern) => (
                pattern.slots().iter().any(|s| {
                    s.dl_span(self.dl_ctrl_symbols)
                        .is_some_and(|(_, n)| n >= min_symbols)
                }),
                pattern.slots().iter().any(|s| {
                    s.ul_span(self.ul_reserved_symbols)
                        .is_some_and(|(_, n)| n >= min_symbols)
                }),
            ),
        };
        if !dl_ok {
            return Err(ConfigError::Symbols(
                "no slot leaves room for DL data after control and DM-RS".to_string(),
            ));
        }
        if !ul_ok {
            return Err(ConfigError::Symbols(
                "no slot leaves room for UL data after reserved symbols and DM-RS".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let layout = SchedulerConfig::default().validate().unwrap();
        assert_eq!(layout.slots_per_frame, 10);
        assert_eq!(layout.dl_rbgs, 13);
        assert_eq!(layout.allocation_type, AllocationType::Rat0);
        assert_eq!(layout.duplex, Duplex::Fdd);
    }

    #[test]
    fn test_tdd_pattern_parsed() {
        let config = SchedulerConfig {
            duplex: "tdd".to_string(),
            tdd_pattern: "DL|DL|S|UL|UL".to_string(),
            special_dl_symbols: 8,
            special_guard_symbols: 2,
            special_ul_symbols: 4,
            ..Default::default()
        };
        let layout = config.validate().unwrap();
        match layout.duplex {
            Duplex::Tdd(pattern) => {
                assert_eq!(pattern.len(), 5);
                assert!(pattern.slot(2).has_dl() && pattern.slot(2).has_ul());
                assert!(!pattern.slot(3).has_dl());
            }
            Duplex::Fdd => panic!("expected TDD"),
        }
    }

    #[test]
    fn test_bad_special_slot_rejected() {
        let config = SchedulerConfig {
            duplex: "tdd".to_string(),
            tdd_pattern: "DL|S|UL".to_string(),
            special_dl_symbols: 8,
            special_guard_symbols: 2,
            special_ul_symbols: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TddPattern { .. })
        ));
    }

    #[test]
    fn test_pattern_without_ul_rejected() {
        let config = SchedulerConfig {
            duplex: "tdd".to_string(),
            tdd_pattern: "DL|DL".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TddPattern { .. })
        ));
    }

    #[test]
    fn test_rb_limit_out_of_range() {
        let config = SchedulerConfig {
            max_rb_per_ue: Some(300),
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::RbLimit {
                limit: 300,
                bandwidth: 52
            }
        );

        let config = SchedulerConfig {
            max_rb_per_ue: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_dmrs_combination() {
        let config = SchedulerConfig {
            mapping_type: "B".to_string(),
            dmrs_symbols: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Dmrs(_))));
    }

    #[test]
    fn test_unknown_strings_rejected() {
        let config = SchedulerConfig {
            strategy: "proportional_fair".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::UnknownStrategy("proportional_fair".to_string())
        );

        let config = SchedulerConfig {
            allocation_type: "rat2".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownAllocationType(_))
        ));
    }

    #[test]
    fn test_ul_prep_and_periods_bounded() {
        let config = SchedulerConfig {
            ul_prep_symbols: MAX_UL_PREP_SYMBOLS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = SchedulerConfig {
            ul_prep_symbols: 4000,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err(), ConfigError::UlPrep(4000));

        let config = SchedulerConfig {
            fdd_periodicity_slots: 200,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::Periodicity(200)
        );

        let config = SchedulerConfig {
            duplex: "tdd".to_string(),
            tdd_pattern: vec!["DL", "UL"].repeat(41).join("|"),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TddPattern { .. })
        ));
    }

    #[test]
    fn test_rv_sequence_validated() {
        let config = SchedulerConfig {
            rv_sequence: vec![0, 4],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::RvSequence(_))));
    }
}
