//! Per-channel batch accumulation
//!
//! Packets are buffered in arrival order and cut into a batch once the
//! buffer reaches `max_batch_size` or its oldest packet is older than
//! `max_batch_age`, or on an explicit flush.

use gridsync_protocol::OrderedPacket;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Arrival-order packet buffer for one channel
#[derive(Debug)]
pub struct BatchAccumulator {
    pending: VecDeque<(Instant, OrderedPacket)>,
    max_batch_size: usize,
    max_batch_age: Duration,
}

impl BatchAccumulator {
    /// Create an accumulator
    pub fn new(max_batch_size: usize, max_batch_age: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            max_batch_size: max_batch_size.max(1),
            max_batch_age,
        }
    }

    /// Buffer a packet
    pub fn push(&mut self, packet: OrderedPacket) {
        self.pending.push_back((Instant::now(), packet));
    }

    /// Buffered packets
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a size or age threshold is reached at `now`
    pub fn is_ready(&self, now: Instant) -> bool {
        match self.pending.front() {
            Some((arrived, _)) => {
                self.pending.len() >= self.max_batch_size
                    || now.saturating_duration_since(*arrived) >= self.max_batch_age
            }
            None => false,
        }
    }

    /// Cut a batch of at most `max_batch_size` packets
    pub fn take_batch(&mut self) -> Vec<OrderedPacket> {
        let n = self.pending.len().min(self.max_batch_size);
        self.pending.drain(..n).map(|(_, p)| p).collect()
    }

    /// Cut a batch if a threshold is reached (or `force`)
    pub fn poll(&mut self, now: Instant, force: bool) -> Option<Vec<OrderedPacket>> {
        if self.pending.is_empty() || !(force || self.is_ready(now)) {
            return None;
        }
        Some(self.take_batch())
    }

    /// Drop buffered packets with key `<= key`; returns their count
    pub fn prune_up_to(&mut self, key: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(_, p)| p.key > key);
        before - self.pending.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
