//! Replication configuration
//!
//! Durations are carried as milliseconds in TOML. Every section has a
//! `Default` and a `validate()` pass; [`ReplicationConfig::validate`] runs
//! them all.

use crate::conflict::Severity;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What the backlog does when an append would exceed `max_weight`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogFullPolicy {
    /// Fail the append with `StorageFull`
    #[default]
    Reject,
    /// Drop the oldest packets and charge them to the channels that missed them
    DiscardOldest,
}

impl std::str::FromStr for BacklogFullPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "discard_oldest" | "discard-oldest" => Ok(Self::DiscardOldest),
            other => Err(format!("unknown backlog full policy: {}", other)),
        }
    }
}

/// Source-side backlog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    /// Retained weight threshold
    pub max_weight: u64,
    /// Policy once the threshold is hit
    pub full_policy: BacklogFullPolicy,
    /// Packets per outbound batch
    pub max_batch_size: usize,
    /// Oldest accumulated packet age that forces a flush
    #[serde(with = "serde_millis")]
    pub max_batch_age: Duration,
    /// Weight charged per discarded packet in the calculated weight
    pub discarded_packet_weight: u64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            max_weight: 100_000,
            full_policy: BacklogFullPolicy::Reject,
            max_batch_size: 100,
            max_batch_age: Duration::from_millis(50),
            discarded_packet_weight: 1,
        }
    }
}

impl BacklogConfig {
    /// Set the weight threshold
    pub fn with_max_weight(mut self, max_weight: u64) -> Self {
        self.max_weight = max_weight;
        self
    }

    /// Set the full policy
    pub fn with_full_policy(mut self, policy: BacklogFullPolicy) -> Self {
        self.full_policy = policy;
        self
    }

    /// Set batch size and age thresholds
    pub fn with_batching(mut self, max_batch_size: usize, max_batch_age: Duration) -> Self {
        self.max_batch_size = max_batch_size;
        self.max_batch_age = max_batch_age;
        self
    }

    /// Validate the backlog section
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_weight == 0 {
            return Err("backlog.max_weight must be at least 1".into());
        }
        if self.max_batch_size == 0 {
            return Err("backlog.max_batch_size must be at least 1".into());
        }
        Ok(())
    }
}

/// Compactor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Time between passes
    #[serde(with = "serde_millis")]
    pub interval: Duration,
    /// Upper bound of packets removed per backlog per pass
    pub max_packets_per_pass: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_packets_per_pass: 10_000,
        }
    }
}

impl CompactionConfig {
    /// Validate the compaction section
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.interval.is_zero() {
            return Err("compaction.interval must be positive".into());
        }
        if self.max_packets_per_pass == 0 {
            return Err("compaction.max_packets_per_pass must be at least 1".into());
        }
        Ok(())
    }
}

/// Kind of grid the target replicates into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Clustered space (backup, gateway peer)
    #[default]
    Clustered,
    /// Non-clustered central store (mirror/archive)
    CentralStore,
}

/// Conflict policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Kind of target
    pub target_kind: TargetKind,
    /// Severity for a write whose entry already exists
    pub already_in_space_severity: Severity,
    /// Severity for an update/take/change whose entry is missing
    pub not_in_space_severity: Severity,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            target_kind: TargetKind::Clustered,
            already_in_space_severity: Severity::Debug,
            not_in_space_severity: Severity::Info,
        }
    }
}

impl ConflictConfig {
    /// Configuration for a central store target
    pub fn central_store() -> Self {
        Self {
            target_kind: TargetKind::CentralStore,
            ..Default::default()
        }
    }
}

/// How many sources may feed one target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPolicy {
    /// At most one attached source (primary/backup)
    #[default]
    SingleActiveSource,
    /// Any number of sources concurrently
    MultiSource,
}

/// Delivery worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Idle wait between polls when nothing is ready
    #[serde(with = "serde_millis")]
    pub poll_interval: Duration,
    /// Attempts per re-establish round before the worker backs off for a full round
    pub reconnect_attempts: u32,
    /// First reconnect delay
    #[serde(with = "serde_millis")]
    pub reconnect_initial_delay: Duration,
    /// Reconnect delay cap
    #[serde(with = "serde_millis")]
    pub reconnect_max_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            reconnect_attempts: 5,
            reconnect_initial_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_secs(5),
        }
    }
}

impl DeliveryConfig {
    /// Validate the delivery section
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.reconnect_attempts == 0 {
            return Err("delivery.reconnect_attempts must be at least 1".into());
        }
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err("delivery.reconnect_initial_delay exceeds reconnect_max_delay".into());
        }
        Ok(())
    }
}

/// Group membership
///
/// Owned by an external membership collaborator. Empty lists admit anyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Group name
    pub name: String,
    /// Sources allowed to feed the group
    pub sources: Vec<String>,
    /// Targets allowed to receive the group
    pub targets: Vec<String>,
}

impl GroupConfig {
    /// Open membership for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Restrict sources
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict targets
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `source` may feed the group
    pub fn allows_source(&self, source: &str) -> bool {
        self.sources.is_empty() || self.sources.iter().any(|s| s == source)
    }

    /// Whether `target` may receive the group
    pub fn allows_target(&self, target: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == target)
    }
}

/// Shared, externally mutated membership; the engine only reads it
#[derive(Debug, Clone, Default)]
pub struct GroupMembership {
    inner: Arc<RwLock<GroupConfig>>,
}

impl GroupMembership {
    /// Wrap a membership descriptor
    pub fn new(config: GroupConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current membership
    pub fn snapshot(&self) -> GroupConfig {
        self.inner.read().clone()
    }

    /// Group name
    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    /// Whether `source` may feed the group
    pub fn allows_source(&self, source: &str) -> bool {
        self.inner.read().allows_source(source)
    }

    /// Whether `target` may receive the group
    pub fn allows_target(&self, target: &str) -> bool {
        self.inner.read().allows_target(target)
    }

    /// Replace the membership (membership-change collaborator)
    pub fn update(&self, config: GroupConfig) {
        tracing::info!(
            "Group {} membership updated: {} sources, {} targets",
            config.name,
            config.sources.len(),
            config.targets.len()
        );
        *self.inner.write() = config;
    }
}

/// Closed key range removed by a compaction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionRange {
    /// First removed key
    pub from: u64,
    /// Last removed key
    pub to: u64,
}

impl CompactionRange {
    /// Create a range
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Whether `key` lies in the range
    pub fn contains(&self, key: u64) -> bool {
        self.from <= key && key <= self.to
    }
}

/// Outcome of a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionResult {
    /// Keys actually removed, `None` when nothing was removed
    pub range: Option<CompactionRange>,
    /// Packets removed
    pub removed: u64,
    /// Weight removed
    pub removed_weight: u64,
    /// Weight left in the log
    pub remaining_weight: u64,
}

/// Top-level configuration of one replication group on one member
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Membership
    pub group: GroupConfig,
    /// Source backlog
    pub backlog: BacklogConfig,
    /// Compactor
    pub compaction: CompactionConfig,
    /// Target conflict policy
    pub conflict: ConflictConfig,
    /// Target attach policy
    pub attach_policy: AttachPolicy,
    /// Delivery worker
    pub delivery: DeliveryConfig,
}

impl ReplicationConfig {
    /// Defaults for `group`
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: GroupConfig::new(group),
            ..Default::default()
        }
    }

    /// Set the backlog section
    pub fn with_backlog(mut self, backlog: BacklogConfig) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the conflict section
    pub fn with_conflict(mut self, conflict: ConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }

    /// Set the attach policy
    pub fn with_attach_policy(mut self, policy: AttachPolicy) -> Self {
        self.attach_policy = policy;
        self
    }

    /// Parse from TOML
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::config(format!("Invalid replication config: {}", e)))?;
        config.validate().map_err(Error::Config)?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        tracing::info!("Loading replication config from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Override the most common knobs from `GRIDSYNC_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("GRIDSYNC_GROUP") {
            self.group.name = name;
        }
        if let Some(weight) = lookup("GRIDSYNC_BACKLOG_MAX_WEIGHT").and_then(|s| s.parse().ok()) {
            self.backlog.max_weight = weight;
        }
        if let Some(policy) = lookup("GRIDSYNC_BACKLOG_FULL_POLICY").and_then(|s| s.parse().ok()) {
            self.backlog.full_policy = policy;
        }
        if let Some(size) = lookup("GRIDSYNC_BATCH_SIZE").and_then(|s| s.parse().ok()) {
            self.backlog.max_batch_size = size;
        }
        if let Some(ms) = lookup("GRIDSYNC_BATCH_AGE_MS").and_then(|s| s.parse().ok()) {
            self.backlog.max_batch_age = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("GRIDSYNC_COMPACTION_INTERVAL_MS").and_then(|s| s.parse().ok()) {
            self.compaction.interval = Duration::from_millis(ms);
        }
    }

    /// Validate every section
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.group.name.is_empty() {
            return Err("group.name must not be empty".into());
        }
        self.backlog.validate()?;
        self.compaction.validate()?;
        self.delivery.validate()?;
        Ok(())
    }
}
