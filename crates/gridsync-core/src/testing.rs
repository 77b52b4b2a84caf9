//! Test helpers shared by unit and integration tests
//!
//! - [`TestContext`]: a temporary directory removed on drop
//! - [`ReplicationPair`]: one source backlog wired to one in-memory replica
//!   through a loopback transport

use crate::applier::InMemoryReplica;
use crate::backlog::SourceGroupBacklog;
use crate::config::{AttachPolicy, BacklogConfig, DeliveryConfig, GroupConfig, GroupMembership};
use crate::conflict::ConflictPolicy;
use crate::delivery::DeliveryWorker;
use crate::error::Result;
use crate::packet_log::PacketLogStorage;
use crate::target::TargetGroup;
use crate::transport::{LoopbackControl, LoopbackTransport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Temporary directory for one test, removed on drop
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a fresh directory
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        std::fs::create_dir_all(temp_dir.path())?;
        Ok(Self { temp_dir })
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Source backlog and target replica of one group, connected in-process
pub struct ReplicationPair {
    /// Shared membership
    pub membership: GroupMembership,
    /// Source backlog
    pub backlog: Arc<SourceGroupBacklog>,
    /// Target group
    pub target: Arc<TargetGroup>,
    /// Data applied on the target
    pub replica: Arc<InMemoryReplica>,
}

impl ReplicationPair {
    /// Pair over an in-memory log
    pub fn new(group: &str, config: BacklogConfig) -> Self {
        let membership = GroupMembership::new(GroupConfig::new(group));
        let backlog = SourceGroupBacklog::in_memory(membership.clone(), config);
        Self::assemble(membership, backlog)
    }

    /// Pair over `log`
    pub fn with_log(group: &str, config: BacklogConfig, log: Box<dyn PacketLogStorage>) -> Self {
        let membership = GroupMembership::new(GroupConfig::new(group));
        let backlog = SourceGroupBacklog::new(membership.clone(), config, log);
        Self::assemble(membership, backlog)
    }

    fn assemble(membership: GroupMembership, backlog: SourceGroupBacklog) -> Self {
        let replica = Arc::new(InMemoryReplica::new());
        let target = Arc::new(TargetGroup::new(
            membership.clone(),
            AttachPolicy::SingleActiveSource,
            ConflictPolicy::default(),
            replica.clone(),
        ));
        Self {
            membership,
            backlog: Arc::new(backlog),
            target,
            replica,
        }
    }

    /// Worker from `source` to the target, with fast reconnects
    pub fn worker(
        &self,
        source: &str,
        target: &str,
    ) -> (DeliveryWorker<LoopbackTransport>, LoopbackControl) {
        let transport = LoopbackTransport::new(self.target.clone());
        let control = transport.control();
        let worker = DeliveryWorker::new(
            source,
            target,
            self.backlog.clone(),
            transport,
            fast_delivery(),
        );
        (worker, control)
    }
}

/// Delivery settings with short polls and reconnect delays
pub fn fast_delivery() -> DeliveryConfig {
    DeliveryConfig {
        poll_interval: Duration::from_millis(1),
        reconnect_attempts: 3,
        reconnect_initial_delay: Duration::from_millis(1),
        reconnect_max_delay: Duration::from_millis(10),
    }
}
