//! Handshake messages exchanged when a channel (re)attaches

/// Sent by the target when a source connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Target has no usable prior state for the group
    pub first_handshake: bool,
    /// Last key the target applied (meaningless on a first handshake)
    pub last_confirmed_key: u64,
    /// Opaque reliable-async consumer state
    pub reliable_async_state: Option<Vec<u8>>,
}

impl HandshakeRequest {
    /// Request for a target without prior state
    pub fn first() -> Self {
        Self {
            first_handshake: true,
            last_confirmed_key: 0,
            reliable_async_state: None,
        }
    }

    /// Request to resume after `last_confirmed_key`
    pub fn resume(last_confirmed_key: u64) -> Self {
        Self {
            first_handshake: false,
            last_confirmed_key,
            reliable_async_state: None,
        }
    }

    /// Attach reliable-async state
    pub fn with_state(mut self, state: Vec<u8>) -> Self {
        self.reliable_async_state = Some(state);
        self
    }
}

/// Sent by the source once it accepted a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// First key the source will deliver
    pub start_key: u64,
    /// Target must drop any stale copy of the group's data
    pub discard_local_state: bool,
    /// Opaque reliable-async producer state
    pub reliable_async_state: Option<Vec<u8>>,
}
