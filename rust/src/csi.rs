//! Channel-state reports and the link-adaptation helpers built on them.

use pyo3::prelude::*;

use crate::models::rbg_width;
use crate::phy::{cqi_to_mcs, MAX_CQI};

/// Latest channel report of a UE in one direction.
///
/// Replaced wholesale on every report.
#[pyclass]
#[derive(Clone, Debug, PartialEq)]
pub struct CsiMeasurement {
    /// CQI per RB. Shorter than the carrier means the last value repeats.
    #[pyo3(get)]
    pub rb_cqi: Vec<u8>,
    #[pyo3(get)]
    pub wideband_cqi: u8,
    /// Rank indicator (layers).
    #[pyo3(get)]
    pub rank: u8,
    /// PMI (DL) or TPMI (UL).
    #[pyo3(get)]
    pub precoder: u16,
    /// Wideband beam the UE is served on.
    #[pyo3(get)]
    pub beam_id: u16,
    /// Complex precoder weights (re, im), used for MU-MIMO orthogonality.
    pub precoder_weights: Option<Vec<(f32, f32)>>,
}

#[pymethods]
impl CsiMeasurement {
    #[new]
    #[pyo3(signature = (rb_cqi, rank=1, precoder=0, beam_id=0, precoder_weights=None))]
    fn py_new(
        rb_cqi: Vec<u8>,
        rank: u8,
        precoder: u16,
        beam_id: u16,
        precoder_weights: Option<Vec<(f32, f32)>>,
    ) -> Self {
        Self::new(rb_cqi, rank, precoder, beam_id).with_weights(precoder_weights)
    }

    fn __repr__(&self) -> String {
        format!(
            "CsiMeasurement(wideband_cqi={}, rank={}, precoder={}, beam_id={}, rbs={})",
            self.wideband_cqi,
            self.rank,
            self.precoder,
            self.beam_id,
            self.rb_cqi.len()
        )
    }
}

impl CsiMeasurement {
    /// Wideband CQI is the floor of the per-RB mean.
    pub fn new(rb_cqi: Vec<u8>, rank: u8, precoder: u16, beam_id: u16) -> Self {
        let rb_cqi: Vec<u8> = rb_cqi.into_iter().map(|c| c.min(MAX_CQI)).collect();
        let wideband_cqi = mean_floor(&rb_cqi);
        Self {
            rb_cqi,
            wideband_cqi,
            rank: rank.max(1),
            precoder,
            beam_id,
            precoder_weights: None,
        }
    }

    /// Flat report: the same CQI on every RB.
    pub fn wideband(cqi: u8, rank: u8) -> Self {
        Self::new(vec![cqi], rank, 0, 0)
    }

    pub fn with_weights(mut self, weights: Option<Vec<(f32, f32)>>) -> Self {
        self.precoder_weights = weights.filter(|w| !w.is_empty());
        self
    }

    pub fn cqi_at(&self, rb: u16) -> u8 {
        match self.rb_cqi.get(rb as usize) {
            Some(cqi) => *cqi,
            None => self.rb_cqi.last().copied().unwrap_or(self.wideband_cqi),
        }
    }

    /// Mean CQI over `[start, start + len)`, floored.
    pub fn range_cqi(&self, start: u16, len: u16) -> u8 {
        if len == 0 {
            return 0;
        }
        let sum: u32 = (start..start + len).map(|rb| self.cqi_at(rb) as u32).sum();
        (sum / len as u32) as u8
    }

    pub fn rbg_cqi(&self, rbg: u16, rbg_size: u16, num_rbs: u16) -> u8 {
        self.range_cqi(rbg * rbg_size, rbg_width(rbg, rbg_size, num_rbs))
    }

    /// MCS for one RBG, `backoff` CQI steps below the report, capped at
    /// `max_mcs`. `None` when the RBG cannot carry data.
    pub fn rbg_mcs(
        &self,
        rbg: u16,
        rbg_size: u16,
        num_rbs: u16,
        backoff: u8,
        max_mcs: u8,
    ) -> Option<u8> {
        let cqi = self.rbg_cqi(rbg, rbg_size, num_rbs).saturating_sub(backoff);
        cqi_to_mcs(cqi).map(|m| m.min(max_mcs))
    }

    pub fn range_mcs(&self, start: u16, len: u16, max_mcs: u8) -> Option<u8> {
        cqi_to_mcs(self.range_cqi(start, len)).map(|m| m.min(max_mcs))
    }

    pub fn wideband_mcs(&self, backoff: u8, max_mcs: u8) -> Option<u8> {
        cqi_to_mcs(self.wideband_cqi.saturating_sub(backoff)).map(|m| m.min(max_mcs))
    }
}

fn mean_floor(values: &[u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    let sum: u32 = values.iter().map(|v| *v as u32).sum();
    (sum / values.len() as u32) as u8
}
