//! HARQ process bookkeeping.
//!
//! Each UE owns a fixed array of processes per direction. A process moves
//! `Free -> InFlight` on a new transmission, `InFlight -> RetxPending` on a
//! NACK (keeping a snapshot of the failed grant), `RetxPending -> InFlight`
//! when the retransmission is granted, and back to `Free` on ACK or when the
//! redundancy-version sequence runs out.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::models::{Allocation, Grant, HarqId, UeId};

/// Errors from HARQ lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarqError {
    #[error("no HARQ entity for UE {0}")]
    UnknownUe(UeId),
    #[error("HARQ process {pid} out of range for UE {ue} ({num} processes)")]
    ProcessOutOfRange { ue: UeId, pid: HarqId, num: usize },
    #[error("HARQ process {pid} of UE {ue} is not waiting for a retransmission")]
    NoRetxPending { ue: UeId, pid: HarqId },
    #[error("retransmission on UE {ue} process {pid} carries {got} bits, block has {expected}")]
    TbsMismatch {
        ue: UeId,
        pid: HarqId,
        expected: u32,
        got: u32,
    },
}

/// Snapshot of the last grant sent on a process.
///
/// Becomes the retransmission context when the transmission fails.
#[derive(Clone, Debug, PartialEq)]
pub struct TxSnapshot {
    pub allocation: Allocation,
    pub start_symbol: u8,
    pub num_symbols: u8,
    pub mcs: u8,
    pub layers: u8,
    pub precoder: u16,
    pub tbs_bits: u32,
}

impl TxSnapshot {
    pub fn from_grant(grant: &Grant) -> Self {
        Self {
            allocation: grant.allocation.clone(),
            start_symbol: grant.start_symbol,
            num_symbols: grant.num_symbols,
            mcs: grant.mcs,
            layers: grant.layers,
            precoder: grant.precoder,
            tbs_bits: grant.tbs_bits,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Free,
    /// Sent, waiting for ACK/NACK.
    InFlight,
    /// NACKed, waiting for resources to retransmit.
    RetxPending,
}

/// One HARQ process.
#[derive(Clone, Debug)]
pub struct HarqProcess {
    pub state: ProcessState,
    /// Position in the RV sequence of the current transmission.
    pub rv_index: usize,
    pub ndi: bool,
    pub layers: u8,
    pub block_error: bool,
    last_tx: Option<TxSnapshot>,
}

impl Default for HarqProcess {
    fn default() -> Self {
        Self {
            state: ProcessState::Free,
            rv_index: 0,
            ndi: false,
            layers: 1,
            block_error: false,
            last_tx: None,
        }
    }
}

impl HarqProcess {
    fn release(&mut self) {
        self.state = ProcessState::Free;
        self.rv_index = 0;
        self.last_tx = None;
    }
}

/// Result of applying ACK/NACK feedback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarqOutcome {
    /// ACK; the transport block is done.
    Delivered { tbs_bits: u32 },
    /// NACK; a retransmission is queued.
    RetxPending,
    /// NACK on the last redundancy version; the transport block is dropped.
    Abandoned { tbs_bits: u32 },
    /// Feedback for a process that was not in flight.
    Ignored,
}

/// HARQ processes of every UE, for one direction.
#[derive(Clone, Debug)]
pub struct HarqManager {
    rv_sequence: Vec<u8>,
    entities: FxHashMap<UeId, Vec<HarqProcess>>,
}

impl HarqManager {
    /// `rv_sequence` must be non-empty (checked by the configuration).
    pub fn new(rv_sequence: Vec<u8>) -> Self {
        Self {
            rv_sequence,
            entities: FxHashMap::default(),
        }
    }

    pub fn add_ue(&mut self, ue: UeId, num_processes: u8) {
        self.entities
            .insert(ue, vec![HarqProcess::default(); num_processes as usize]);
    }

    pub fn remove_ue(&mut self, ue: UeId) {
        self.entities.remove(&ue);
    }

    pub fn num_processes(&self, ue: UeId) -> usize {
        self.entities.get(&ue).map_or(0, |p| p.len())
    }

    /// Lowest-numbered free process.
    pub fn find_free_process(&self, ue: UeId) -> Option<HarqId> {
        self.entities
            .get(&ue)?
            .iter()
            .position(|p| p.state == ProcessState::Free)
            .map(|pid| pid as HarqId)
    }

    pub fn has_free_process(&self, ue: UeId) -> bool {
        self.find_free_process(ue).is_some()
    }

    pub fn process(&self, ue: UeId, pid: HarqId) -> Result<&HarqProcess, HarqError> {
        let processes = self.entities.get(&ue).ok_or(HarqError::UnknownUe(ue))?;
        processes
            .get(pid as usize)
            .ok_or(HarqError::ProcessOutOfRange {
                ue,
                pid,
                num: processes.len(),
            })
    }

    fn process_mut(&mut self, ue: UeId, pid: HarqId) -> Result<&mut HarqProcess, HarqError> {
        let processes = self
            .entities
            .get_mut(&ue)
            .ok_or(HarqError::UnknownUe(ue))?;
        let num = processes.len();
        processes
            .get_mut(pid as usize)
            .ok_or(HarqError::ProcessOutOfRange { ue, pid, num })
    }

    /// Start a new transport block on `pid`: toggle NDI, restart the RV
    /// sequence. Returns `(rv, ndi)` for the grant.
    pub fn begin_new_tx(
        &mut self,
        ue: UeId,
        pid: HarqId,
        snapshot: TxSnapshot,
    ) -> Result<(u8, bool), HarqError> {
        let first_rv = self.rv_sequence[0];
        let process = self.process_mut(ue, pid)?;
        process.ndi = !process.ndi;
        process.rv_index = 0;
        process.layers = snapshot.layers;
        process.block_error = false;
        process.state = ProcessState::InFlight;
        process.last_tx = Some(snapshot);
        Ok((first_rv, process.ndi))
    }

    /// Commit a retransmission on `pid`: advance the RV index, clear the
    /// retransmission context and remember the new grant. NDI is untouched.
    /// The grant must carry the transport block size of the original
    /// transmission.
    pub fn advance_on_tx(
        &mut self,
        ue: UeId,
        pid: HarqId,
        snapshot: TxSnapshot,
    ) -> Result<u8, HarqError> {
        let last_idx = self.rv_sequence.len() - 1;
        let process = self.process_mut(ue, pid)?;
        if process.state != ProcessState::RetxPending {
            return Err(HarqError::NoRetxPending { ue, pid });
        }
        let expected = process.last_tx.as_ref().map_or(0, |s| s.tbs_bits);
        if snapshot.tbs_bits != expected {
            return Err(HarqError::TbsMismatch {
                ue,
                pid,
                expected,
                got: snapshot.tbs_bits,
            });
        }
        process.rv_index = (process.rv_index + 1).min(last_idx);
        process.layers = snapshot.layers;
        process.state = ProcessState::InFlight;
        process.last_tx = Some(snapshot);
        let rv_index = process.rv_index;
        Ok(self.rv_sequence[rv_index])
    }

    /// Apply ACK (`success`) or NACK feedback.
    pub fn on_ack_nack(
        &mut self,
        ue: UeId,
        pid: HarqId,
        success: bool,
    ) -> Result<HarqOutcome, HarqError> {
        let last_idx = self.rv_sequence.len() - 1;
        let process = self.process_mut(ue, pid)?;
        if process.state != ProcessState::InFlight {
            return Ok(HarqOutcome::Ignored);
        }
        let tbs_bits = process.last_tx.as_ref().map_or(0, |s| s.tbs_bits);

        if success {
            process.block_error = false;
            process.release();
            return Ok(HarqOutcome::Delivered { tbs_bits });
        }

        process.block_error = true;
        if process.rv_index >= last_idx {
            process.release();
            return Ok(HarqOutcome::Abandoned { tbs_bits });
        }
        process.state = ProcessState::RetxPending;
        Ok(HarqOutcome::RetxPending)
    }

    /// Retransmission context of `pid`, if it is waiting for one.
    pub fn retx_context(&self, ue: UeId, pid: HarqId) -> Option<&TxSnapshot> {
        let process = self.process(ue, pid).ok()?;
        match process.state {
            ProcessState::RetxPending => process.last_tx.as_ref(),
            _ => None,
        }
    }

    /// Lowest-numbered process of `ue` waiting for a retransmission.
    pub fn pending_retx(&self, ue: UeId) -> Option<(HarqId, &TxSnapshot)> {
        self.entities.get(&ue)?.iter().enumerate().find_map(|(pid, p)| {
            match (p.state, p.last_tx.as_ref()) {
                (ProcessState::RetxPending, Some(ctx)) => Some((pid as HarqId, ctx)),
                _ => None,
            }
        })
    }

    /// UEs with at least one retransmission waiting, in ascending ID order.
    pub fn ues_with_pending_retx(&self) -> Vec<UeId> {
        let mut ues: Vec<UeId> = self
            .entities
            .iter()
            .filter(|(_, procs)| procs.iter().any(|p| p.state == ProcessState::RetxPending))
            .map(|(ue, _)| *ue)
            .collect();
        ues.sort_unstable();
        ues
    }
}
