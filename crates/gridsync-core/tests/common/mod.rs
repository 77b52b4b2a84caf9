//! Shared helpers for gridsync-core integration tests

#![allow(dead_code)]

use gridsync_core::SourceGroupBacklog;
use gridsync_protocol::{EntryData, EntryOperation, HandshakeRequest, Payload};
use std::sync::Once;
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once; `RUST_LOG` selects the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "gridsync_core=warn".into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Write of a single `Order` entry
pub fn write(uid: &str) -> EntryOperation {
    EntryOperation::Write(EntryData::new("Order", uid, 1, uid.as_bytes().to_vec()))
}

/// Non-transactional batch of `ops` writes; its weight is `ops`
pub fn weighted(prefix: &str, ops: usize) -> Payload {
    Payload::Batch((0..ops).map(|i| write(&format!("{}-{}", prefix, i))).collect())
}

/// Register `target` with a first handshake and drain everything it is owed
pub fn attach_and_drain(backlog: &SourceGroupBacklog, target: &str) -> Vec<u64> {
    backlog.handshake(target, &HandshakeRequest::first()).unwrap();
    drain(backlog, target)
}

/// Keys of every batch `target` can take right now
pub fn drain(backlog: &SourceGroupBacklog, target: &str) -> Vec<u64> {
    let mut keys = Vec::new();
    loop {
        match backlog.flush(target).unwrap() {
            Some(batch) => keys.extend(batch.packets.iter().map(|p| p.key)),
            None if backlog.status(target).map(|s| s.accumulated) == Some(0) => break,
            None => continue,
        }
    }
    keys
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
