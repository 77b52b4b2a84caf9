//! Background compaction of group backlogs
//!
//! Every tick each registered backlog drops the head packets that all of its
//! channels have confirmed, at most `max_packets_per_pass` per group.

use crate::backlog::SourceGroupBacklog;
use crate::config::CompactionConfig;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

/// Compactor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactorStats {
    /// Completed passes
    pub passes: u64,
    /// Packets removed over all passes
    pub packets_removed: u64,
    /// Weight removed over all passes
    pub weight_removed: u64,
    /// Backlogs that failed to compact
    pub failures: u64,
}

/// Outcome of one pass over all backlogs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimPass {
    /// Packets removed
    pub removed: u64,
    /// Weight removed
    pub removed_weight: u64,
}

/// Periodic frontier-bounded trimming of every registered backlog
pub struct Compactor {
    config: CompactionConfig,
    backlogs: RwLock<Vec<Arc<SourceGroupBacklog>>>,
    stats: Mutex<CompactorStats>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Compactor {
    /// Create a compactor with no backlogs
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            backlogs: RwLock::new(Vec::new()),
            stats: Mutex::new(CompactorStats::default()),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Add a backlog to trim
    pub fn register(&self, backlog: Arc<SourceGroupBacklog>) {
        tracing::debug!("Compactor registered group {}", backlog.group());
        self.backlogs.write().push(backlog);
    }

    /// Stop trimming `group`
    pub fn unregister(&self, group: &str) -> bool {
        let mut backlogs = self.backlogs.write();
        let before = backlogs.len();
        backlogs.retain(|b| b.group() != group);
        before != backlogs.len()
    }

    /// Compact every registered backlog once
    ///
    /// A backlog that fails is logged and skipped; the others still run.
    pub fn trim_once(&self) -> TrimPass {
        let backlogs: Vec<Arc<SourceGroupBacklog>> = self.backlogs.read().clone();
        let mut pass = TrimPass::default();
        let mut failures = 0u64;

        for backlog in &backlogs {
            match backlog.compact(self.config.max_packets_per_pass) {
                Ok(result) => {
                    pass.removed += result.removed;
                    pass.removed_weight += result.removed_weight;
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!("Compaction of group {} failed: {}", backlog.group(), e);
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.passes += 1;
        stats.packets_removed += pass.removed;
        stats.weight_removed += pass.removed_weight;
        stats.failures += failures;
        pass
    }

    /// Run passes every `interval` until [`Compactor::stop`]
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::config("Compactor already running"));
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Compactor started (interval {:?})", self.config.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Compactor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let pass = self.trim_once();
                    if pass.removed > 0 {
                        tracing::debug!(
                            "Compaction pass removed {} packets (weight {})",
                            pass.removed,
                            pass.removed_weight
                        );
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the background loop
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Statistics
    pub fn stats(&self) -> CompactorStats {
        self.stats.lock().clone()
    }
}
