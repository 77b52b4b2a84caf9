//! Gridsync Core - data-mutation replication engine
//!
//! Captures every mutation a primary partition performs, orders it and
//! delivers it to replica targets, surviving reconnects, slow consumers and
//! partial failures while bounding the memory and disk the backlog uses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── source ────────────────────────┐
//! │  SourceGroupBacklog ──> PacketLog (memory / file)       │
//! │        │  ConfirmationTracker        ▲                  │
//! │        ▼                             │ Compactor        │
//! │  DeliveryWorker ── OrderedTransport ─┼──────────────────┘
//! └──────────────────────────────────────┼─────────────────┐
//! │  TargetSession ──> TargetGroup ──> TargetChannel        │
//! │                                        │ ConflictPolicy │
//! │                                        ▼                │
//! │                                   ReplicaApplier        │
//! └──────────────────────── target ────────────────────────┘
//! ```
//!
//! Delivery is at-least-once and in key order per channel. Targets resolve
//! replays and divergences through the conflict policy instead of failing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod backlog;
pub mod compactor;
pub mod config;
pub mod confirmation;
pub mod conflict;
pub mod delivery;
pub mod error;
pub mod handshake;
pub mod packet_log;
pub mod retry;
pub mod target;
pub mod testing;
pub mod transport;
pub mod weight;

pub use applier::{ApplyError, InMemoryReplica, ReplicaApplier, StoredEntry};
pub use backlog::{BacklogHealth, ChannelStatus, Cursor, SourceGroupBacklog};
pub use compactor::{Compactor, CompactorStats, TrimPass};
pub use config::{
    AttachPolicy, BacklogConfig, BacklogFullPolicy, CompactionConfig, CompactionRange,
    CompactionResult, ConflictConfig, DeliveryConfig, GroupConfig, GroupMembership,
    ReplicationConfig, TargetKind,
};
pub use confirmation::{ConfirmationState, ConfirmationTracker, ConfirmationView};
pub use conflict::{Conflict, ConflictPolicy, Resolution, Severity};
pub use delivery::{DeliveryStats, DeliveryWorker};
pub use error::{Error, PendingError, Result};
pub use handshake::{ChannelState, RetainedRange, negotiate};
pub use packet_log::{
    FileLogOptions, FilePacketLog, LogSize, MemoryPacketLog, PacketIter, PacketLogStorage,
};
pub use retry::{RetryConfig, RetryTask, run_task};
pub use target::{TargetChannel, TargetChannelStats, TargetGroup, TargetSession};
pub use transport::{FrameHandler, LoopbackControl, LoopbackTransport, OrderedTransport};
pub use weight::calculated_weight;
