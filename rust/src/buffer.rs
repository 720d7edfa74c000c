//! Pending-data bookkeeping per UE.
//!
//! Downlink queues are keyed by logical channel, uplink queues by logical
//! channel group. Reports overwrite a queue's size; new-transmission grants
//! drain queues in ascending channel order.

use std::collections::BTreeMap;

use thiserror::Error;

/// Logical channel groups a UE can report.
pub const NUM_LCG: u8 = 8;

/// Errors from report ingestion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("empty buffer status report")]
    EmptyReport,
    #[error("logical channel group {0} out of range")]
    LcgOutOfRange(u8),
}

/// Upper bound in bytes of each 5-bit short BSR level. The last level means
/// "more than 150000".
static SHORT_BSR_TABLE: [u32; 32] = [
    0, 10, 14, 20, 28, 38, 53, 74, 102, 142, 198, 276, 384, 535, 745, 1038, 1446, 2014, 2806,
    3909, 5446, 7587, 10570, 14726, 20516, 28581, 39818, 55474, 77284, 107669, 150000, 150001,
];

/// Bytes assumed for a short BSR level; the level's upper bound.
pub fn short_bsr_bytes(index: u8) -> u32 {
    SHORT_BSR_TABLE[(index & 0x1f) as usize]
}

/// One decoded short BSR entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BsrEntry {
    pub lcg: u8,
    pub bytes: u32,
}

/// Decode raw short BSR MAC CEs, one octet each: LCG id in the top three bits,
/// buffer size index in the low five.
pub fn parse_short_bsr(raw: &[u8]) -> Result<Vec<BsrEntry>, BufferError> {
    if raw.is_empty() {
        return Err(BufferError::EmptyReport);
    }
    Ok(raw
        .iter()
        .map(|octet| BsrEntry {
            lcg: octet >> 5,
            bytes: short_bsr_bytes(octet & 0x1f),
        })
        .collect())
}

/// Pending bytes per queue and their total.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferStatus {
    queues: BTreeMap<u8, u32>,
    total: u64,
}

impl BufferStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending size of `queue`.
    pub fn set(&mut self, queue: u8, bytes: u32) {
        let old = self.queues.insert(queue, bytes).unwrap_or(0);
        self.total = self.total - old as u64 + bytes as u64;
        if bytes == 0 {
            self.queues.remove(&queue);
        }
    }

    pub fn get(&self, queue: u8) -> u32 {
        self.queues.get(&queue).copied().unwrap_or(0)
    }

    /// Total pending bytes, saturated to `u32`.
    pub fn total(&self) -> u32 {
        self.total.min(u32::MAX as u64) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Remove up to `bytes` from the queues, lowest id first. Returns how many
    /// bytes were actually drained.
    pub fn consume(&mut self, bytes: u32) -> u32 {
        let mut remaining = bytes;
        let mut emptied = Vec::new();
        for (queue, pending) in self.queues.iter_mut() {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(*pending);
            *pending -= take;
            remaining -= take;
            if *pending == 0 {
                emptied.push(*queue);
            }
        }
        for queue in emptied {
            self.queues.remove(&queue);
        }
        let drained = bytes - remaining;
        self.total -= drained as u64;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_queue_size() {
        let mut buffer = BufferStatus::new();
        buffer.set(3, 1000);
        buffer.set(4, 500);
        assert_eq!(buffer.total(), 1500);

        buffer.set(3, 200);
        assert_eq!(buffer.total(), 700);
        assert_eq!(buffer.get(3), 200);

        buffer.set(4, 0);
        assert_eq!(buffer.total(), 200);
        assert_eq!(buffer.get(4), 0);
    }

    #[test]
    fn test_consume_drains_lowest_queue_first() {
        let mut buffer = BufferStatus::new();
        buffer.set(5, 300);
        buffer.set(1, 100);
        assert_eq!(buffer.consume(150), 150);
        assert_eq!(buffer.get(1), 0);
        assert_eq!(buffer.get(5), 250);
        assert_eq!(buffer.total(), 250);

        // Over-sized grant drains everything and reports what it took
        assert_eq!(buffer.consume(1000), 250);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_short_bsr() {
        // LCG 2, index 10 (<= 198 bytes); LCG 0, index 0
        let entries = parse_short_bsr(&[(2 << 5) | 10, 0]).unwrap();
        assert_eq!(
            entries,
            vec![
                BsrEntry { lcg: 2, bytes: 198 },
                BsrEntry { lcg: 0, bytes: 0 }
            ]
        );
        assert_eq!(parse_short_bsr(&[]), Err(BufferError::EmptyReport));
    }

    #[test]
    fn test_short_bsr_table_monotonic() {
        for idx in 1..32u8 {
            assert!(short_bsr_bytes(idx) > short_bsr_bytes(idx - 1));
        }
    }
}
