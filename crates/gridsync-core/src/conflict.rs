//! Replay and conflict policy on the target
//!
//! Delivery is at-least-once and targets restart, so a replicated operation
//! can meet a local state that already reflects it or diverges from it. The
//! policy maps (operation kind, local condition) to a [`Resolution`]. Neither
//! an ignored nor a reported conflict reaches the transport: no retry, no
//! channel teardown. Both are logged at the chosen [`Severity`].

use crate::config::{ConflictConfig, TargetKind};
use gridsync_protocol::OperationKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log level a conflict is reported at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Debug
    Debug,
    /// Info
    Info,
    /// Warn
    Warn,
    /// Error
    Error,
}

impl Severity {
    /// One level less severe (Debug stays Debug)
    pub fn lower(self) -> Self {
        match self {
            Self::Error => Self::Warn,
            Self::Warn => Self::Info,
            Self::Info | Self::Debug => Self::Debug,
        }
    }

    fn log(self, message: &str) {
        match self {
            Self::Debug => tracing::debug!("{}", message),
            Self::Info => tracing::info!("{}", message),
            Self::Warn => tracing::warn!("{}", message),
            Self::Error => tracing::error!("{}", message),
        }
    }
}

/// Local condition that stopped an operation from applying as-is
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Entry to write already exists
    #[error("entry {uid} already in space")]
    AlreadyInSpace {
        /// Entry uid
        uid: String,
    },

    /// Entry to update/take/change does not exist
    #[error("entry {uid} not in space")]
    NotInSpace {
        /// Entry uid
        uid: String,
    },

    /// Entry is locked by a local transaction
    #[error("entry {uid} locked by transaction {txn_id}")]
    LockedByTransaction {
        /// Entry uid
        uid: String,
        /// Lock holder
        txn_id: u64,
    },

    /// Local version differs from the one the operation expects
    #[error("entry {uid} version conflict: replicated version {expected}, local version {actual}")]
    VersionConflict {
        /// Entry uid
        uid: String,
        /// Version carried by the operation
        expected: u64,
        /// Version held locally
        actual: u64,
    },

    /// Type unknown to the target
    #[error("missing type metadata for {type_name}")]
    MissingTypeMetadata {
        /// Type name
        type_name: String,
    },
}

/// Outcome of the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Apply anyway, overwriting local state
    Apply,
    /// Expected replay; skip the operation
    Ignore(Severity),
    /// Unexpected divergence; skip the operation and count it
    Report(Severity),
}

/// Conflict decision table
#[derive(Debug, Clone, Default)]
pub struct ConflictPolicy {
    config: ConflictConfig,
}

impl ConflictPolicy {
    /// Create a policy
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    fn central_store(&self, transient: bool) -> bool {
        self.config.target_kind == TargetKind::CentralStore && !transient
    }

    /// Decide what to do about `conflict` for an operation of `kind`
    pub fn decide(&self, kind: OperationKind, conflict: &Conflict, transient: bool) -> Resolution {
        use OperationKind::{Change, Take, Update, Write};

        match (kind, conflict) {
            (Write, Conflict::AlreadyInSpace { .. }) => {
                if self.central_store(transient) {
                    Resolution::Apply
                } else {
                    Resolution::Ignore(self.config.already_in_space_severity)
                }
            }
            (Take, Conflict::NotInSpace { .. }) if self.central_store(transient) => {
                Resolution::Ignore(self.config.not_in_space_severity.lower())
            }
            (Update | Take | Change, Conflict::NotInSpace { .. }) => {
                Resolution::Ignore(self.config.not_in_space_severity)
            }
            (Update | Take | Change, Conflict::LockedByTransaction { .. }) => {
                Resolution::Ignore(Severity::Error)
            }
            (Update | Take, Conflict::VersionConflict { .. }) => Resolution::Ignore(Severity::Warn),
            (Take, Conflict::MissingTypeMetadata { .. }) => Resolution::Ignore(Severity::Error),
            _ => Resolution::Report(Severity::Error),
        }
    }

    /// Decide and log
    pub fn resolve(
        &self,
        group: &str,
        key: u64,
        kind: OperationKind,
        conflict: &Conflict,
        transient: bool,
    ) -> Resolution {
        let resolution = self.decide(kind, conflict, transient);
        match resolution {
            Resolution::Apply => {
                tracing::debug!(
                    "Group {} key {}: {:?} overwrites ({})",
                    group,
                    key,
                    kind,
                    conflict
                );
            }
            Resolution::Ignore(severity) => {
                let hint = match conflict {
                    Conflict::MissingTypeMetadata { .. } => {
                        "; check external data source replication settings"
                    }
                    _ => "",
                };
                severity.log(&format!(
                    "Group {} key {}: ignoring replicated {:?}: {}{}",
                    group, key, kind, conflict, hint
                ));
            }
            Resolution::Report(severity) => {
                severity.log(&format!(
                    "Group {} key {}: unexpected conflict for replicated {:?}: {}",
                    group, key, kind, conflict
                ));
            }
        }
        resolution
    }
}
