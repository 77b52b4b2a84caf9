//! Confirmation tracking
//!
//! Every channel owns one [`ConfirmationState`]: the highest key the far end
//! acknowledged, an optional error pinned to a later key, the weight it still
//! has to confirm and how many packets were discarded before it saw them.
//! The source keeps one state per registered channel in a
//! [`ConfirmationTracker`]; the compactor only ever sees the minimum over all
//! of them through [`ConfirmationTracker::frontier`].

use crate::error::{Error, PendingError};
use crate::weight::calculated_weight;
use std::collections::HashMap;

/// Per-channel confirmation record
#[derive(Debug, Clone, Default)]
pub struct ConfirmationState {
    last_confirmed_key: u64,
    pending_error: Option<PendingError>,
    weight: u64,
    discarded_packets_count: u64,
}

impl ConfirmationState {
    /// Create a state that has confirmed everything up to `last_confirmed_key`
    pub fn new(last_confirmed_key: u64) -> Self {
        Self {
            last_confirmed_key,
            ..Default::default()
        }
    }

    /// Highest confirmed key
    pub fn last_confirmed_key(&self) -> u64 {
        self.last_confirmed_key
    }

    /// Advance confirmation to `key`
    ///
    /// Keys at or below the current confirmation are a no-op. Passing the key
    /// of a pending error clears it. Returns whether confirmation moved.
    pub fn advance(&mut self, key: u64) -> bool {
        if key <= self.last_confirmed_key {
            return false;
        }
        self.last_confirmed_key = key;
        if let Some(pending) = &self.pending_error {
            if pending.key <= key {
                tracing::debug!(
                    "Pending error at key {} cleared by confirmation {}",
                    pending.key,
                    key
                );
                self.pending_error = None;
            }
        }
        true
    }

    /// Record an error against `key`
    ///
    /// Ignored when `key` is already confirmed. A later error replaces an
    /// earlier one.
    pub fn set_pending_error(&mut self, key: u64, error: Error) -> bool {
        if key <= self.last_confirmed_key {
            return false;
        }
        self.pending_error = Some(PendingError::new(key, error));
        true
    }

    /// Pending error, if confirmation has not passed it yet
    pub fn pending_error(&self) -> Option<&PendingError> {
        self.pending_error.as_ref()
    }

    /// Drop the pending error without confirming
    pub fn clear_pending_error(&mut self) {
        self.pending_error = None;
    }

    /// Weight still to be confirmed
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Add weight for newly assigned packets
    pub fn add_weight(&mut self, weight: u64) {
        self.weight = self.weight.saturating_add(weight);
    }

    /// Remove weight for confirmed or discarded packets
    pub fn sub_weight(&mut self, weight: u64) {
        self.weight = self.weight.saturating_sub(weight);
    }

    /// Replace the weight (recomputed at handshake)
    pub fn set_weight(&mut self, weight: u64) {
        self.weight = weight;
    }

    /// Packets discarded before this channel confirmed them
    pub fn discarded_packets_count(&self) -> u64 {
        self.discarded_packets_count
    }

    /// Charge `count` discarded packets of total `weight`
    pub fn record_discarded(&mut self, count: u64, weight: u64) {
        self.discarded_packets_count = self.discarded_packets_count.saturating_add(count);
        self.sub_weight(weight);
    }

    /// Read-only snapshot
    pub fn view(&self) -> ConfirmationView {
        ConfirmationView {
            last_confirmed_key: self.last_confirmed_key,
            pending_error_key: self.pending_error.as_ref().map(|p| p.key),
            weight: self.weight,
            discarded_packets_count: self.discarded_packets_count,
        }
    }
}

/// Snapshot of a [`ConfirmationState`] for readers that must not mutate it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationView {
    /// Highest confirmed key
    pub last_confirmed_key: u64,
    /// Key of the pending error, if any
    pub pending_error_key: Option<u64>,
    /// Weight still to be confirmed
    pub weight: u64,
    /// Packets discarded before confirmation
    pub discarded_packets_count: u64,
}

impl ConfirmationView {
    /// Weight including the discarded-packet charge
    pub fn calculated_weight(&self, discarded_packet_weight: u64) -> u64 {
        calculated_weight(
            self.weight,
            self.discarded_packets_count,
            discarded_packet_weight,
        )
    }
}

/// Confirmation states of every channel registered with one group
#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    states: HashMap<String, ConfirmationState>,
}

impl ConfirmationTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh state for `channel`, replacing any previous one
    pub fn register(&mut self, channel: &str, last_confirmed_key: u64) -> &mut ConfirmationState {
        let state = self.states.entry(channel.to_string()).or_default();
        *state = ConfirmationState::new(last_confirmed_key);
        state
    }

    /// Destroy the state of `channel`
    pub fn remove(&mut self, channel: &str) -> Option<ConfirmationState> {
        self.states.remove(channel)
    }

    /// Whether `channel` is registered
    pub fn contains(&self, channel: &str) -> bool {
        self.states.contains_key(channel)
    }

    /// Mutable state of `channel`
    pub fn get_mut(&mut self, channel: &str) -> Option<&mut ConfirmationState> {
        self.states.get_mut(channel)
    }

    /// Read-only view of `channel`
    pub fn view(&self, channel: &str) -> Option<ConfirmationView> {
        self.states.get(channel).map(ConfirmationState::view)
    }

    /// Views of every registered channel
    pub fn views(&self) -> impl Iterator<Item = (&str, ConfirmationView)> {
        self.states.iter().map(|(name, s)| (name.as_str(), s.view()))
    }

    /// States of every registered channel
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfirmationState)> {
        self.states.iter().map(|(name, s)| (name.as_str(), s))
    }

    /// Mutable states of every registered channel
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ConfirmationState)> {
        self.states.iter_mut().map(|(name, s)| (name.as_str(), s))
    }

    /// Lowest confirmed key over all channels; `None` with no channels
    pub fn frontier(&self) -> Option<u64> {
        self.states.values().map(|s| s.last_confirmed_key).min()
    }

    /// Number of registered channels
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True when no channel is registered
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop every state
    pub fn clear(&mut self) {
        self.states.clear();
    }
}
