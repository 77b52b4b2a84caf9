//! Error types for the gridsync replication engine

use gridsync_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using the gridsync Error
pub type Result<T> = std::result::Result<T, Error>;

/// Replication engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or mismatched frame; the connection attempt is rejected
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Another source currently feeds the target group
    #[error("Group {group}: source {active} already attached, rejected {attempted}")]
    SourceAlreadyAttached {
        /// Target group
        group: String,
        /// Source holding the group
        active: String,
        /// Source that tried to attach
        attempted: String,
    },

    /// Append would exceed the configured capacity
    #[error("Group {group}: backlog full (weight {weight}, threshold {threshold})")]
    StorageFull {
        /// Group whose backlog is full
        group: String,
        /// Weight after the rejected append
        weight: u64,
        /// Configured threshold
        threshold: u64,
    },

    /// Underlying packet log storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Packet log failed its integrity check and refuses further use
    #[error("Packet log compromised: {0}")]
    LogCompromised(String),

    /// Resume key is no longer retained; the target must re-attach as a first handshake
    #[error("Resume key {requested} already compacted (earliest retained {earliest})")]
    ResumeKeyCompacted {
        /// First key the target asked for
        requested: u64,
        /// Earliest key still in the log
        earliest: u64,
    },

    /// Handshake rejected without mutating any state
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Channel-level failure (gap, invalid state transition, unknown channel)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Source or target not listed in the group membership
    #[error("Unknown member: {0}")]
    UnknownMember(String),

    /// Replica applier failed with a non-conflict error
    #[error("Apply error: {0}")]
    Apply(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from file-backed storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Retryable errors (temporary failures)
    #[error("Retryable error: {0}")]
    Retryable(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a log-compromised error
    pub fn log_compromised(msg: impl Into<String>) -> Self {
        Self::LogCompromised(msg.into())
    }

    /// Create a handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Fatal for the packet log instance: the group must be rebuilt from a full resync
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::LogCompromised(_) | Self::Io(_))
    }

    /// Worth retrying after a backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable(_) | Self::Transport(_) | Self::ResumeKeyCompacted { .. } => true,
            // Channel failures are cleared by a fresh handshake
            Self::Channel(_) => true,
            Self::Io(io_error) => matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Error recorded against a key on a channel's confirmation state
#[derive(Debug, Clone)]
pub struct PendingError {
    /// Key the error was recorded for
    pub key: u64,
    /// The error
    pub error: Arc<Error>,
}

impl PendingError {
    /// Record `error` against `key`
    pub fn new(key: u64, error: Error) -> Self {
        Self {
            key,
            error: Arc::new(error),
        }
    }
}
