//! Throughput fairness metrics.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::models::{Direction, UeId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FairnessError {
    #[error("invalid throughput value {value:?} at position {position}")]
    InvalidValue { value: String, position: usize },
}

/// Jain's fairness index `(sum x)^2 / (N * sum x^2)`.
///
/// 1.0 when every UE gets the same throughput, 1/N when one UE gets
/// everything. Empty input or all-zero throughput yields 0.
pub fn jains_fairness_index(throughputs: &[f64]) -> f64 {
    if throughputs.is_empty() {
        return 0.0;
    }
    let sum: f64 = throughputs.iter().sum();
    let sum_sq: f64 = throughputs.iter().map(|x| x * x).sum();
    let denominator = throughputs.len() as f64 * sum_sq;
    if denominator == 0.0 {
        return 0.0;
    }
    sum * sum / denominator
}

/// Parse a dash-separated throughput series such as `"0.75-0.13"`.
pub fn parse_throughput_series(series: &str) -> Result<Vec<f64>, FairnessError> {
    series
        .split('-')
        .enumerate()
        .map(|(position, value)| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| FairnessError::InvalidValue {
                    value: value.to_string(),
                    position,
                })
        })
        .collect()
}

/// Acknowledged bits per UE and direction.
#[derive(Clone, Debug, Default)]
pub struct ThroughputTracker {
    delivered_bits: FxHashMap<UeId, [u64; 2]>,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `ue` at zero so it counts even before its first ACK.
    pub fn register(&mut self, ue: UeId) {
        self.delivered_bits.entry(ue).or_insert([0; 2]);
    }

    pub fn remove(&mut self, ue: UeId) {
        self.delivered_bits.remove(&ue);
    }

    pub fn record(&mut self, direction: Direction, ue: UeId, bits: u32) {
        let entry = self.delivered_bits.entry(ue).or_insert([0; 2]);
        entry[direction.index()] += bits as u64;
    }

    pub fn delivered_bits(&self, direction: Direction, ue: UeId) -> u64 {
        self.delivered_bits
            .get(&ue)
            .map_or(0, |bits| bits[direction.index()])
    }

    /// Jain's index over every tracked UE.
    pub fn fairness_index(&self, direction: Direction) -> f64 {
        let throughputs: Vec<f64> = self
            .delivered_bits
            .values()
            .map(|bits| bits[direction.index()] as f64)
            .collect();
        jains_fairness_index(&throughputs)
    }
}
