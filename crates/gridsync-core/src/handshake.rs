//! Channel state machine and resume negotiation
//!
//! ```text
//! Disconnected ──> Handshaking ──> Active ──> Closing ──> Disconnected
//!                      │             │
//!                      └─────────────┴──────> Disconnected
//! ```
//!
//! Negotiation is a pure function of the target's request and the range the
//! source still retains, so a failed handshake never mutates anything.

use crate::error::{Error, Result};
use gridsync_protocol::{HandshakeRequest, HandshakeResponse};
use std::fmt;

/// Lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No live connection
    #[default]
    Disconnected,
    /// Resume negotiation in progress; no application traffic
    Handshaking,
    /// Delivering packets
    Active,
    /// Being detached
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Handshaking => "HANDSHAKING",
            Self::Active => "ACTIVE",
            Self::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

impl ChannelState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Handshaking)
                | (Handshaking, Active)
                | (Handshaking, Disconnected)
                | (Active, Closing)
                | (Active, Disconnected)
                | (Closing, Disconnected)
        )
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: ChannelState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::channel(format!(
                "invalid channel transition {} -> {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    /// True unless handshaking: application traffic may flow
    pub fn is_not_handshaking(self) -> bool {
        self != ChannelState::Handshaking
    }
}

/// Keys the source can still serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedRange {
    /// Oldest retained key (`None` when the log is empty)
    pub first_key: Option<u64>,
    /// Key the next append will receive
    pub next_key: u64,
}

impl RetainedRange {
    /// Earliest key a channel can start from
    pub fn earliest(&self) -> u64 {
        self.first_key.unwrap_or(self.next_key)
    }
}

/// Decide where delivery starts for `request`
///
/// - first handshake: from the earliest retained key, telling the target to
///   drop its stale copy of the group
/// - resume: from `last_confirmed_key + 1`, failing with
///   [`Error::ResumeKeyCompacted`] when that key is gone and with
///   [`Error::Handshake`] when the target claims a key never issued
pub fn negotiate(request: &HandshakeRequest, range: RetainedRange) -> Result<HandshakeResponse> {
    if request.first_handshake {
        return Ok(HandshakeResponse {
            start_key: range.earliest(),
            discard_local_state: true,
            reliable_async_state: None,
        });
    }

    let requested = request.last_confirmed_key.checked_add(1).ok_or_else(|| {
        Error::handshake(format!(
            "last confirmed key {} out of range",
            request.last_confirmed_key
        ))
    })?;
    if requested > range.next_key {
        return Err(Error::handshake(format!(
            "target confirmed key {} but source only issued up to {}",
            request.last_confirmed_key,
            range.next_key.saturating_sub(1)
        )));
    }
    let earliest = range.earliest();
    if requested < earliest {
        return Err(Error::ResumeKeyCompacted {
            requested,
            earliest,
        });
    }

    Ok(HandshakeResponse {
        start_key: requested,
        discard_local_state: false,
        reliable_async_state: None,
    })
}
