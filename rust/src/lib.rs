//! 5G gNB MAC resource scheduler.
//!
//! Decides, once per slot, which UEs get uplink and downlink resources, with
//! which MCS, and whether each grant is a new transmission or a HARQ
//! retransmission. Supports FDD and TDD cells and both RBG-bitmap (RAT-0) and
//! contiguous (RAT-1) frequency allocation.

// Allow clippy warning triggered by PyO3 macro expansion
#![allow(clippy::useless_conversion)]

use pyo3::prelude::*;

pub mod alloc;
pub mod buffer;
pub mod config;
pub mod csi;
pub mod fairness;
pub mod harq;
pub mod logging;
pub mod mask;
pub mod models;
pub mod phy;
pub mod scheduler;
pub mod slot;
pub mod strategy;

pub use buffer::{parse_short_bsr, BufferError, BufferStatus};
pub use config::{CellLayout, ConfigError, SchedulerConfig};
pub use csi::CsiMeasurement;
pub use fairness::{jains_fairness_index, parse_throughput_series, FairnessError};
pub use harq::{HarqError, HarqManager, HarqOutcome};
pub use mask::ResourceMask;
pub use models::{Allocation, Direction, Grant, HarqId, TimingInfo, TxKind, UeId};
pub use phy::{CapacityOracle, CapacityRequest, ProportionalCapacity};
pub use scheduler::{ConnectionParams, MacScheduler, SchedulerError, SchedulerStats};
pub use strategy::{RoundRobin, SchedulingStrategy};

fn value_error(err: impl std::fmt::Display) -> PyErr {
    pyo3::exceptions::PyValueError::new_err(err.to_string())
}

/// MAC scheduler for one cell (PyO3 wrapper).
///
/// Holds boxed trait objects, so it stays on the thread that created it.
#[pyclass(unsendable, name = "MacScheduler")]
pub struct PyMacScheduler {
    inner: MacScheduler,
}

#[pymethods]
impl PyMacScheduler {
    /// Raises ValueError if the configuration is invalid.
    #[new]
    fn new(config: SchedulerConfig) -> PyResult<Self> {
        let inner = MacScheduler::new(config).map_err(value_error)?;
        Ok(Self { inner })
    }

    #[pyo3(signature = (ue, num_harq_processes=None, antennas=1, initial_cqi=7))]
    fn add_connection(
        &mut self,
        ue: UeId,
        num_harq_processes: Option<u8>,
        antennas: u8,
        initial_cqi: u8,
    ) -> PyResult<()> {
        let params = ConnectionParams {
            num_harq_processes,
            antennas,
            initial_cqi,
        };
        self.inner.add_connection(ue, params).map_err(value_error)
    }

    fn remove_connection(&mut self, ue: UeId) -> PyResult<()> {
        self.inner.remove_connection(ue).map_err(value_error)
    }

    fn update_dl_buffer_status(&mut self, ue: UeId, lcid: u8, bytes: u32) -> PyResult<()> {
        self.inner
            .update_dl_buffer_status(ue, lcid, bytes)
            .map_err(value_error)
    }

    fn update_ul_buffer_status(&mut self, ue: UeId, lcg: u8, bytes: u32) -> PyResult<()> {
        self.inner
            .update_ul_buffer_status(ue, lcg, bytes)
            .map_err(value_error)
    }

    /// Apply raw short BSR octets (LCG id in the top 3 bits, level in the low 5).
    fn process_bsr(&mut self, ue: UeId, raw: Vec<u8>) -> PyResult<()> {
        self.inner.process_bsr(ue, &raw).map_err(value_error)
    }

    fn update_channel_quality(
        &mut self,
        direction: Direction,
        ue: UeId,
        report: CsiMeasurement,
    ) -> PyResult<()> {
        self.inner
            .update_channel_quality(direction, ue, report)
            .map_err(value_error)
    }

    fn run_dl_scheduler(&mut self, timing: TimingInfo) -> Vec<Grant> {
        self.inner.run_dl_scheduler(timing)
    }

    fn run_ul_scheduler(&mut self, timing: TimingInfo) -> Vec<Grant> {
        self.inner.run_ul_scheduler(timing)
    }

    /// HARQ feedback. Returns "delivered", "retx_pending", "abandoned" or
    /// "ignored".
    fn on_rx_result(
        &mut self,
        direction: Direction,
        ue: UeId,
        pid: HarqId,
        success: bool,
    ) -> PyResult<&'static str> {
        let outcome = self
            .inner
            .on_rx_result(direction, ue, pid, success)
            .map_err(value_error)?;
        Ok(match outcome {
            HarqOutcome::Delivered { .. } => "delivered",
            HarqOutcome::RetxPending => "retx_pending",
            HarqOutcome::Abandoned { .. } => "abandoned",
            HarqOutcome::Ignored => "ignored",
        })
    }

    fn fairness_index(&self, direction: Direction) -> f64 {
        self.inner.fairness_index(direction)
    }

    fn delivered_bits(&self, direction: Direction, ue: UeId) -> u64 {
        self.inner.delivered_bits(direction, ue)
    }

    fn stats(&self) -> SchedulerStats {
        self.inner.stats().clone()
    }

    fn __repr__(&self) -> String {
        format!(
            "MacScheduler(ues={}, duplex={:?})",
            self.inner.num_connections(),
            self.inner.config().duplex
        )
    }
}

/// Jain's fairness index of a list of per-UE throughputs.
///
/// # Arguments
/// * `throughputs` - Per-UE throughput values, any unit
///
/// # Returns
/// * `(sum x)^2 / (N * sum x^2)`, or 0 for empty or all-zero input
#[pyfunction]
#[pyo3(name = "jains_fairness_index")]
fn py_jains_fairness_index(throughputs: Vec<f64>) -> f64 {
    jains_fairness_index(&throughputs)
}

/// Jain's fairness index of a dash-separated series such as "0.75-0.13".
///
/// # Raises
/// * ValueError if a value does not parse
#[pyfunction]
fn series_fairness_index(series: &str) -> PyResult<f64> {
    let values = parse_throughput_series(series).map_err(value_error)?;
    Ok(jains_fairness_index(&values))
}

/// The gnb_sched.rust Python module.
#[pymodule]
fn rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Core data types
    m.add_class::<Direction>()?;
    m.add_class::<TxKind>()?;
    m.add_class::<TimingInfo>()?;
    m.add_class::<Grant>()?;
    m.add_class::<CsiMeasurement>()?;
    m.add_class::<SchedulerStats>()?;

    // Config types
    m.add_class::<SchedulerConfig>()?;

    // Scheduler
    m.add_class::<PyMacScheduler>()?;

    // Metrics
    m.add_function(wrap_pyfunction!(py_jains_fairness_index, m)?)?;
    m.add_function(wrap_pyfunction!(series_fairness_index, m)?)?;

    Ok(())
}
