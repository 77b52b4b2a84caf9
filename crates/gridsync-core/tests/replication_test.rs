//! End-to-end replication over the loopback transport: the delivery run loop,
//! link failures, background compaction and source failover

mod common;

use common::{drain, init_tracing, wait_until, write};
use gridsync_core::testing::{ReplicationPair, fast_delivery};
use gridsync_core::{
    AttachPolicy, BacklogConfig, CompactionConfig, Compactor, ConflictPolicy, DeliveryWorker,
    Error, GroupConfig, GroupMembership, InMemoryReplica, LoopbackTransport, SourceGroupBacklog,
    TargetGroup,
};
use gridsync_protocol::HandshakeRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

fn quick_batches() -> BacklogConfig {
    BacklogConfig::default().with_batching(8, Duration::from_millis(2))
}

fn add_orders(backlog: &SourceGroupBacklog, range: std::ops::Range<usize>) {
    for i in range {
        backlog
            .add(write(&format!("order-{}", i)), false)
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_run_loop_replicates_and_compacts() {
    init_tracing();
    let pair = ReplicationPair::new("orders", quick_batches());
    let (mut worker, _) = pair.worker("primary", "backup");
    worker.establish().await.unwrap();

    let compactor = Arc::new(Compactor::new(CompactionConfig {
        interval: Duration::from_millis(5),
        ..Default::default()
    }));
    compactor.register(pair.backlog.clone());
    let runner = compactor.clone();
    let compaction = tokio::spawn(async move { runner.start().await });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivery = tokio::spawn(worker.run(shutdown_rx));

    add_orders(&pair.backlog, 0..50);
    assert!(wait_until(WAIT, || pair.replica.len() == 50).await);
    assert!(wait_until(WAIT, || pair.backlog.size() == 0).await);

    shutdown_tx.send(true).unwrap();
    let stats = delivery.await.unwrap();
    assert_eq!(stats.packets_sent, 50);
    assert_eq!(stats.last_acked_key, 50);
    assert_eq!(stats.handshakes, 1);

    compactor.stop();
    compaction.await.unwrap().unwrap();
    assert!(compactor.stats().packets_removed >= 50);
    assert!(pair.backlog.health().is_healthy());
}

#[tokio::test]
async fn test_severed_link_resumes_without_loss() {
    init_tracing();
    let pair = ReplicationPair::new("orders", quick_batches());
    let (mut worker, control) = pair.worker("primary", "backup");
    worker.establish().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivery = tokio::spawn(worker.run(shutdown_rx));

    add_orders(&pair.backlog, 0..20);
    assert!(wait_until(WAIT, || pair.replica.len() == 20).await);

    control.sever();
    add_orders(&pair.backlog, 20..40);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(pair.replica.len(), 20);
    assert_eq!(pair.backlog.size(), 40);

    control.heal();
    assert!(wait_until(WAIT, || pair.replica.len() == 40).await);
    assert!(control.epochs() >= 2);

    // The target resumed instead of resyncing: nothing was cleared
    let status = pair.backlog.status("backup").unwrap();
    assert!(status.handshakes >= 2);
    assert!(!status.resync_required);

    shutdown_tx.send(true).unwrap();
    let stats = delivery.await.unwrap();
    assert_eq!(stats.last_acked_key, 40);
    assert!(stats.reconnect_failures > 0 || stats.delivery_failures > 0);
    assert_eq!(stats.resyncs, 0);
}

#[tokio::test]
async fn test_compacted_resume_forces_full_resync() {
    init_tracing();
    let pair = ReplicationPair::new("orders", quick_batches());
    let (mut worker, _) = pair.worker("primary", "backup");
    worker.establish().await.unwrap();
    add_orders(&pair.backlog, 0..5);
    worker.deliver_pending().await.unwrap();
    worker.disconnect().await;
    pair.backlog.detach_channel("backup").unwrap();

    // Another channel keeps the group logging and lets the head move on
    pair.backlog
        .handshake("auditor", &HandshakeRequest::first())
        .unwrap();
    add_orders(&pair.backlog, 5..10);
    assert_eq!(drain(&pair.backlog, "auditor"), vec![6, 7, 8, 9, 10]);
    pair.backlog.confirm("auditor", 10).unwrap();
    pair.backlog.compact(usize::MAX).unwrap();
    assert_eq!(pair.backlog.retained_range().first_key, None);

    worker.establish().await.unwrap();
    assert_eq!(worker.stats().resyncs, 1);
    assert!(pair.replica.is_empty());

    add_orders(&pair.backlog, 10..12);
    worker.deliver_pending().await.unwrap();
    assert_eq!(pair.replica.len(), 2);
    assert!(pair.replica.contains("order-11"));
    assert!(!pair.replica.contains("order-0"));
}

fn failover_group() -> (GroupMembership, Arc<TargetGroup>, Arc<InMemoryReplica>) {
    let membership = GroupMembership::new(
        GroupConfig::new("orders")
            .with_sources(["primary", "standby"])
            .with_targets(["backup"]),
    );
    let replica = Arc::new(InMemoryReplica::new());
    let target = Arc::new(TargetGroup::new(
        membership.clone(),
        AttachPolicy::SingleActiveSource,
        ConflictPolicy::default(),
        replica.clone(),
    ));
    (membership, target, replica)
}

#[tokio::test]
async fn test_failover_to_standby_source() {
    init_tracing();
    let (membership, target, replica) = failover_group();
    let primary_log = Arc::new(SourceGroupBacklog::in_memory(
        membership.clone(),
        quick_batches(),
    ));
    let standby_log = Arc::new(SourceGroupBacklog::in_memory(
        membership.clone(),
        quick_batches(),
    ));

    let mut primary = DeliveryWorker::new(
        "primary",
        "backup",
        primary_log.clone(),
        LoopbackTransport::new(target.clone()),
        fast_delivery(),
    );
    primary.establish().await.unwrap();
    add_orders(&primary_log, 0..10);
    primary.deliver_pending().await.unwrap();
    assert_eq!(replica.len(), 10);

    let mut standby = DeliveryWorker::new(
        "standby",
        "backup",
        standby_log.clone(),
        LoopbackTransport::new(target.clone()),
        fast_delivery(),
    );
    let err = standby.establish().await.unwrap_err();
    assert!(matches!(err, Error::Retryable(_)));
    assert!(err.is_retryable());
    assert_eq!(target.attached_sources(), vec!["primary".to_string()]);

    // The standby keeps retrying in the background until the primary leaves
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivery = tokio::spawn(standby.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(20)).await;
    primary.disconnect().await;

    assert!(
        wait_until(WAIT, || target.attached_sources() == vec!["standby".to_string()]).await
    );
    assert!(wait_until(WAIT, || standby_log.status("backup").is_some()).await);
    add_orders(&standby_log, 100..105);
    assert!(wait_until(WAIT, || replica.contains("order-104")).await);

    // The standby's first handshake replaced the primary's copy
    assert_eq!(replica.len(), 5);

    shutdown_tx.send(true).unwrap();
    let stats = delivery.await.unwrap();
    assert_eq!(stats.handshakes, 1);
    assert!(stats.reconnect_failures > 0);
}
