//! In-memory packet log

use super::{LogSize, PacketIter, PacketLogStorage, check_append, check_sequence};
use crate::config::{CompactionRange, CompactionResult};
use crate::error::{Error, Result};
use gridsync_protocol::OrderedPacket;
use std::collections::VecDeque;

/// `VecDeque`-backed packet log with an optional packet-count capacity
#[derive(Debug)]
pub struct MemoryPacketLog {
    name: String,
    packets: VecDeque<OrderedPacket>,
    weight: u64,
    last_appended: Option<u64>,
    max_packets: Option<usize>,
    size: LogSize,
    closed: bool,
    compromised: Option<String>,
}

impl MemoryPacketLog {
    /// Unbounded log
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            packets: VecDeque::new(),
            weight: 0,
            last_appended: None,
            max_packets: None,
            size: LogSize::default(),
            closed: false,
            compromised: None,
        }
    }

    /// Log holding at most `max_packets`
    pub fn with_capacity(name: impl Into<String>, max_packets: usize) -> Self {
        Self {
            max_packets: Some(max_packets),
            packets: VecDeque::with_capacity(max_packets.min(4096)),
            ..Self::new(name)
        }
    }

    fn guard(&self) -> Result<()> {
        if self.closed {
            return Err(Error::storage(format!("packet log {} is closed", self.name)));
        }
        if let Some(reason) = &self.compromised {
            return Err(Error::log_compromised(format!("{}: {}", self.name, reason)));
        }
        Ok(())
    }

    fn publish_size(&self) {
        self.size.set(self.packets.len() as u64, self.weight);
    }

    /// Pop head packets while `keep_going` holds, up to `limit`
    fn pop_head_while(
        &mut self,
        limit: usize,
        keep_going: impl Fn(&OrderedPacket) -> bool,
    ) -> Vec<OrderedPacket> {
        let mut removed = Vec::new();
        while removed.len() < limit {
            match self.packets.front() {
                Some(head) if keep_going(head) => {}
                _ => break,
            }
            if let Some(packet) = self.packets.pop_front() {
                self.weight = self.weight.saturating_sub(packet.weight as u64);
                removed.push(packet);
            }
        }
        self.publish_size();
        removed
    }

    #[cfg(test)]
    pub(crate) fn push_unchecked(&mut self, packet: OrderedPacket) {
        self.weight += packet.weight as u64;
        self.last_appended = Some(packet.key);
        self.packets.push_back(packet);
        self.publish_size();
    }
}

impl PacketLogStorage for MemoryPacketLog {
    fn append_batch(&mut self, packets: Vec<OrderedPacket>) -> Result<()> {
        self.guard()?;
        check_append(self.last_appended, &packets)?;

        if let Some(max) = self.max_packets {
            let wanted = self.packets.len() + packets.len();
            if wanted > max {
                return Err(Error::StorageFull {
                    group: self.name.clone(),
                    weight: wanted as u64,
                    threshold: max as u64,
                });
            }
        }

        for packet in packets {
            self.weight += packet.weight as u64;
            self.last_appended = Some(packet.key);
            self.packets.push_back(packet);
        }
        self.publish_size();
        Ok(())
    }

    fn size_probe(&self) -> LogSize {
        self.size.clone()
    }

    fn weight(&self) -> u64 {
        self.weight
    }

    fn first_key(&self) -> Option<u64> {
        self.packets.front().map(|p| p.key)
    }

    fn last_key(&self) -> Option<u64> {
        self.packets.back().map(|p| p.key)
    }

    fn last_appended_key(&self) -> Option<u64> {
        self.last_appended
    }

    fn remove_first_batch(&mut self, capacity: usize, frontier: u64) -> Result<Vec<OrderedPacket>> {
        self.guard()?;
        Ok(self.pop_head_while(capacity, |p| p.key <= frontier))
    }

    fn delete_oldest_packets(&mut self, up_to_inclusive: u64) -> Result<u64> {
        self.guard()?;
        let removed = self.pop_head_while(usize::MAX, |p| p.key <= up_to_inclusive);
        Ok(removed.len() as u64)
    }

    fn read_only_iterator(&self, from_key: Option<u64>) -> Result<PacketIter<'_>> {
        self.guard()?;
        let start = match from_key {
            Some(key) => self.packets.partition_point(|p| p.key < key),
            None => 0,
        };
        Ok(Box::new(
            self.packets
                .range(start..)
                .cloned()
                .map(Ok::<OrderedPacket, Error>),
        ))
    }

    fn perform_compaction(&mut self, from: u64, to: u64) -> Result<CompactionResult> {
        self.guard()?;
        if from > to {
            return Err(Error::storage(format!("invalid compaction range [{}, {}]", from, to)));
        }
        if let Some(first) = self.first_key() {
            if from > first {
                return Err(Error::storage(format!(
                    "compaction range [{}, {}] does not start at head {}",
                    from, to, first
                )));
            }
        }

        let removed = self.pop_head_while(usize::MAX, |p| p.key <= to);
        let removed_weight = removed.iter().map(|p| p.weight as u64).sum();
        let range = match (removed.first(), removed.last()) {
            (Some(first), Some(last)) => Some(CompactionRange::new(first.key, last.key)),
            _ => None,
        };

        Ok(CompactionResult {
            range,
            removed: removed.len() as u64,
            removed_weight,
            remaining_weight: self.weight,
        })
    }

    fn validate_integrity(&mut self) -> Result<()> {
        self.guard()?;
        let entries = self.packets.iter().map(|p| (p.key, p.weight));
        if let Err(reason) = check_sequence(entries, self.size.len(), self.weight) {
            tracing::error!("Packet log {} compromised: {}", self.name, reason);
            self.compromised = Some(reason.clone());
            return Err(Error::log_compromised(format!("{}: {}", self.name, reason)));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.packets.clear();
        self.weight = 0;
        self.publish_size();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
