//! Per-UE scheduler state and running counters.

use pyo3::prelude::*;

use crate::buffer::BufferStatus;
use crate::csi::CsiMeasurement;
use crate::models::{Direction, UeId};

/// Everything the scheduler tracks for one connected UE, apart from HARQ.
#[derive(Clone, Debug)]
pub struct UeState {
    pub ue: UeId,
    /// Antenna ports; caps the rank a report can ask for.
    pub antennas: u8,
    buffers: [BufferStatus; 2],
    csi: [CsiMeasurement; 2],
}

impl UeState {
    /// Until the first report, both directions assume a flat `initial_cqi`.
    pub fn new(ue: UeId, antennas: u8, initial_cqi: u8) -> Self {
        let flat = CsiMeasurement::wideband(initial_cqi, 1);
        Self {
            ue,
            antennas: antennas.max(1),
            buffers: [BufferStatus::new(), BufferStatus::new()],
            csi: [flat.clone(), flat],
        }
    }

    pub fn buffer(&self, direction: Direction) -> &BufferStatus {
        &self.buffers[direction.index()]
    }

    pub fn buffer_mut(&mut self, direction: Direction) -> &mut BufferStatus {
        &mut self.buffers[direction.index()]
    }

    pub fn csi(&self, direction: Direction) -> &CsiMeasurement {
        &self.csi[direction.index()]
    }

    pub fn set_csi(&mut self, direction: Direction, report: CsiMeasurement) {
        self.csi[direction.index()] = report;
    }

    /// Layers the UE can be served with right now.
    pub fn rank(&self, direction: Direction) -> u8 {
        self.csi(direction).rank.clamp(1, self.antennas)
    }
}

/// Counters since the scheduler was created.
#[pyclass]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    #[pyo3(get)]
    pub new_tx_grants: u64,
    #[pyo3(get)]
    pub retx_grants: u64,
    /// Retransmissions sent below their original capacity.
    #[pyo3(get)]
    pub forced_retx: u64,
    /// RBGs shared by an MU-MIMO pair.
    #[pyo3(get)]
    pub mu_paired_rbgs: u64,
    #[pyo3(get)]
    pub delivered_tbs: u64,
    #[pyo3(get)]
    pub nacks: u64,
    /// Transport blocks dropped after the last redundancy version.
    #[pyo3(get)]
    pub abandoned_tbs: u64,
}

#[pymethods]
impl SchedulerStats {
    fn __repr__(&self) -> String {
        format!(
            "SchedulerStats(new_tx={}, retx={}, forced={}, delivered={}, nacks={}, abandoned={})",
            self.new_tx_grants,
            self.retx_grants,
            self.forced_retx,
            self.delivered_tbs,
            self.nacks,
            self.abandoned_tbs
        )
    }
}
