//! Packet log storage
//!
//! The ordered, append-only record of replicated operations for one group.
//! The backlog depends only on [`PacketLogStorage`]; any implementation
//! (memory, local disk) must keep keys strictly increasing and contiguous.
//!
//! # Concurrency
//!
//! Mutators take `&mut self` and readers `&self`, so the owner enforces the
//! reader/writer discipline (the backlog keeps the log behind a `RwLock`).
//! The one exception is [`LogSize`]: a cloned probe that reads atomics and can
//! be polled without touching any lock.

pub mod file;
pub mod memory;

pub use file::{FileLogOptions, FilePacketLog};
pub use memory::MemoryPacketLog;

use crate::config::CompactionResult;
use crate::error::Result;
use gridsync_protocol::OrderedPacket;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Forward-only iterator over retained packets
pub type PacketIter<'a> = Box<dyn Iterator<Item = Result<OrderedPacket>> + Send + 'a>;

/// Storage contract for a group's packet log
pub trait PacketLogStorage: Send + Sync {
    /// Append packets at the tail
    ///
    /// Keys must be strictly greater than the current last key and strictly
    /// increasing within the batch. Fails with `StorageFull` when the
    /// storage's own capacity would be exceeded. Nothing is appended on error.
    fn append_batch(&mut self, packets: Vec<OrderedPacket>) -> Result<()>;

    /// Lock-free size probe
    fn size_probe(&self) -> LogSize;

    /// Number of retained packets
    fn size(&self) -> u64 {
        self.size_probe().len()
    }

    /// Sum of retained packet weights
    fn weight(&self) -> u64;

    /// Oldest retained key
    fn first_key(&self) -> Option<u64>;

    /// Newest retained key
    fn last_key(&self) -> Option<u64>;

    /// Highest key ever appended, retained or not
    ///
    /// New keys must stay above it even after the log was emptied.
    fn last_appended_key(&self) -> Option<u64>;

    /// Remove and return up to `capacity` packets from the head, never one
    /// with a key above `frontier`
    fn remove_first_batch(&mut self, capacity: usize, frontier: u64) -> Result<Vec<OrderedPacket>>;

    /// Remove every packet with key `<= up_to_inclusive`; returns the count
    fn delete_oldest_packets(&mut self, up_to_inclusive: u64) -> Result<u64>;

    /// Iterate retained packets starting at `from_key` (or the head)
    fn read_only_iterator(&self, from_key: Option<u64>) -> Result<PacketIter<'_>>;

    /// Remove the closed range `[from, to]`
    ///
    /// The range must start at or before the head; the caller guarantees
    /// `to` does not exceed what every channel confirmed.
    fn perform_compaction(&mut self, from: u64, to: u64) -> Result<CompactionResult>;

    /// Check key monotonicity, contiguity and the tracked size/weight
    ///
    /// A failure is fatal: the instance refuses every later mutation.
    fn validate_integrity(&mut self) -> Result<()>;

    /// Release resources; every later call fails
    fn close(&mut self) -> Result<()>;

    /// Whether `close` was called
    fn is_closed(&self) -> bool;
}

/// Packet count and weight readable without any lock
///
/// Values may lag a concurrent writer by one update.
#[derive(Debug, Clone, Default)]
pub struct LogSize {
    inner: Arc<LogSizeInner>,
}

#[derive(Debug, Default)]
struct LogSizeInner {
    packets: AtomicU64,
    weight: AtomicU64,
}

impl LogSize {
    /// Retained packets
    pub fn len(&self) -> u64 {
        self.inner.packets.load(Ordering::Acquire)
    }

    /// True when nothing is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained weight
    pub fn weight(&self) -> u64 {
        self.inner.weight.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, packets: u64, weight: u64) {
        self.inner.packets.store(packets, Ordering::Release);
        self.inner.weight.store(weight, Ordering::Release);
    }
}

/// Verify a `(key, weight)` sequence against tracked totals
pub(crate) fn check_sequence<I>(
    entries: I,
    tracked_len: u64,
    tracked_weight: u64,
) -> std::result::Result<(), String>
where
    I: IntoIterator<Item = (u64, u32)>,
{
    let mut previous: Option<u64> = None;
    let mut len = 0u64;
    let mut weight = 0u64;

    for (key, w) in entries {
        if let Some(prev) = previous {
            if key <= prev {
                return Err(format!("key {} follows {} (not increasing)", key, prev));
            }
            if key != prev + 1 {
                return Err(format!("gap between keys {} and {}", prev, key));
            }
        }
        previous = Some(key);
        len += 1;
        weight += w as u64;
    }

    if len != tracked_len {
        return Err(format!("tracked size {} but {} packets present", tracked_len, len));
    }
    if weight != tracked_weight {
        return Err(format!("tracked weight {} but packets sum to {}", tracked_weight, weight));
    }
    Ok(())
}

/// Check that `packets` continue `last_key` without gaps
///
/// Only the first append into a log that never held a packet may pick its
/// starting key.
pub(crate) fn check_append(last_key: Option<u64>, packets: &[OrderedPacket]) -> Result<()> {
    let mut previous = last_key;
    for packet in packets {
        if let Some(prev) = previous {
            if packet.key != prev + 1 {
                return Err(crate::Error::storage(format!(
                    "append key {} does not follow {}",
                    packet.key, prev
                )));
            }
        }
        previous = Some(packet.key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_sequence_accepts_contiguous() {
        assert!(check_sequence([(4, 1), (5, 2), (6, 3)], 3, 6).is_ok());
        assert!(check_sequence(std::iter::empty(), 0, 0).is_ok());
    }

    #[test]
    fn test_check_sequence_rejects_gap() {
        let err = check_sequence([(1, 1), (3, 1)], 2, 2).unwrap_err();
        assert!(err.contains("gap"));
    }

    #[test]
    fn test_check_sequence_rejects_duplicates() {
        let err = check_sequence([(2, 1), (2, 1)], 2, 2).unwrap_err();
        assert!(err.contains("not increasing"));
    }

    #[test]
    fn test_check_sequence_rejects_drifted_totals() {
        assert!(check_sequence([(1, 2)], 1, 3).is_err());
        assert!(check_sequence([(1, 2)], 2, 2).is_err());
    }

    #[test]
    fn test_size_probe_is_shared() {
        let probe = LogSize::default();
        let clone = probe.clone();
        probe.set(3, 9);
        assert_eq!(clone.len(), 3);
        assert_eq!(clone.weight(), 9);
        assert!(!clone.is_empty());
    }
}
