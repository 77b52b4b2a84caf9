//! Source backlog scenarios: ordering, handshakes, weight accounting,
//! backlog-full policies and frontier-bounded compaction

mod common;

use common::{attach_and_drain, drain, init_tracing, weighted, write};
use gridsync_core::{
    BacklogConfig, BacklogFullPolicy, ChannelState, Cursor, Error, GroupConfig, GroupMembership,
    SourceGroupBacklog,
};
use gridsync_protocol::HandshakeRequest;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

fn backlog(config: BacklogConfig) -> SourceGroupBacklog {
    SourceGroupBacklog::in_memory(GroupMembership::new(GroupConfig::new("orders")), config)
}

fn fill(backlog: &SourceGroupBacklog, count: usize) -> Vec<u64> {
    (0..count)
        .map(|i| {
            backlog
                .add(write(&format!("o-{}", i)), false)
                .unwrap()
                .unwrap()
        })
        .collect()
}

#[test]
fn test_append_confirm_compact() {
    init_tracing();
    let backlog = backlog(BacklogConfig::default());
    assert!(attach_and_drain(&backlog, "backup").is_empty());

    assert_eq!(fill(&backlog, 5), vec![1, 2, 3, 4, 5]);
    assert_eq!(drain(&backlog, "backup"), vec![1, 2, 3, 4, 5]);
    assert!(backlog.confirm("backup", 3).unwrap());
    assert!(!backlog.confirm("backup", 2).unwrap());

    let result = backlog.compact(usize::MAX).unwrap();
    assert_eq!(result.removed, 3);
    assert_eq!(backlog.size(), 2);
    assert_eq!(backlog.retained_range().first_key, Some(4));
    assert_eq!(backlog.frontier(), Some(3));
}

#[test]
fn test_resume_delivers_unconfirmed_suffix() {
    init_tracing();
    let backlog = backlog(BacklogConfig::default());
    attach_and_drain(&backlog, "backup");
    fill(&backlog, 5);
    drain(&backlog, "backup");
    backlog.confirm("backup", 3).unwrap();

    backlog.channel_disconnected("backup").unwrap();
    assert_eq!(
        backlog.status("backup").unwrap().state,
        ChannelState::Disconnected
    );

    let response = backlog
        .handshake("backup", &HandshakeRequest::resume(3))
        .unwrap();
    assert_eq!(response.start_key, 4);
    assert!(!response.discard_local_state);
    assert_eq!(
        backlog.status("backup").unwrap().cursor,
        Cursor::CatchingUp { next_key: 4 }
    );
    assert_eq!(drain(&backlog, "backup"), vec![4, 5]);

    // Writes after catch-up go through the live accumulator
    fill(&backlog, 1);
    assert_eq!(drain(&backlog, "backup"), vec![6]);
    assert_eq!(backlog.status("backup").unwrap().handshakes, 2);
}

#[test]
fn test_first_handshake_starts_at_retained_head() {
    init_tracing();
    let backlog = backlog(BacklogConfig::default());
    attach_and_drain(&backlog, "fast");
    attach_and_drain(&backlog, "slow");
    fill(&backlog, 5);
    drain(&backlog, "fast");
    drain(&backlog, "slow");
    backlog.confirm("fast", 5).unwrap();
    backlog.confirm("slow", 2).unwrap();

    assert_eq!(backlog.compact(usize::MAX).unwrap().removed, 2);

    let response = backlog
        .handshake("mirror", &HandshakeRequest::first())
        .unwrap();
    assert_eq!(response.start_key, 3);
    assert!(response.discard_local_state);
    assert_eq!(drain(&backlog, "mirror"), vec![3, 4, 5]);

    // A stale resume point behind the head is refused and changes nothing
    let before = backlog.status("slow").unwrap();
    let err = backlog
        .handshake("slow", &HandshakeRequest::resume(1))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ResumeKeyCompacted {
            requested: 2,
            earliest: 3
        }
    ));
    assert_eq!(backlog.status("slow").unwrap(), before);
}

#[test]
fn test_resume_beyond_issued_keys_is_refused() {
    let backlog = backlog(BacklogConfig::default());
    attach_and_drain(&backlog, "backup");
    fill(&backlog, 2);
    let err = backlog
        .handshake("backup", &HandshakeRequest::resume(7))
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));
}

#[test]
fn test_weight_follows_payload_size() {
    init_tracing();
    let backlog = backlog(BacklogConfig::default());
    attach_and_drain(&backlog, "backup");
    for i in 0..5 {
        backlog
            .add_generic(weighted(&format!("b{}", i), 2), false, false)
            .unwrap();
    }
    assert_eq!(backlog.weight(), 10);
    assert_eq!(backlog.status("backup").unwrap().weight, 10);

    drain(&backlog, "backup");
    backlog.confirm("backup", 3).unwrap();
    assert_eq!(backlog.status("backup").unwrap().weight, 4);

    let result = backlog.compact(usize::MAX).unwrap();
    assert_eq!(result.removed, 3);
    assert_eq!(result.removed_weight, 6);
    assert_eq!(result.remaining_weight, 4);
    assert_eq!(backlog.weight(), 4);
}

#[test]
fn test_full_backlog_rejects_appends() {
    let backlog = backlog(
        BacklogConfig::default()
            .with_max_weight(3)
            .with_full_policy(BacklogFullPolicy::Reject),
    );
    attach_and_drain(&backlog, "backup");
    fill(&backlog, 3);

    let err = backlog.add(write("overflow"), false).unwrap_err();
    assert!(matches!(err, Error::StorageFull { threshold: 3, .. }));
    assert!(!err.is_retryable());
    assert_eq!(backlog.size(), 3);
    assert_eq!(backlog.retained_range().next_key, 4);

    // Compaction frees room again
    drain(&backlog, "backup");
    backlog.confirm("backup", 1).unwrap();
    backlog.compact(usize::MAX).unwrap();
    assert_eq!(backlog.add(write("fits"), false).unwrap(), Some(4));
}

#[test]
fn test_full_backlog_discards_oldest() {
    init_tracing();
    let backlog = backlog(
        BacklogConfig::default()
            .with_max_weight(3)
            .with_full_policy(BacklogFullPolicy::DiscardOldest),
    );
    attach_and_drain(&backlog, "backup");
    assert_eq!(fill(&backlog, 5), vec![1, 2, 3, 4, 5]);

    assert_eq!(backlog.size(), 3);
    assert_eq!(backlog.retained_range().first_key, Some(3));

    let status = backlog.status("backup").unwrap();
    assert_eq!(status.discarded_packets_count, 2);
    assert!(status.resync_required);
    assert!(!backlog.health().is_healthy());
    assert_eq!(backlog.health().resync_required, vec!["backup".to_string()]);

    let err = backlog.next_batch("backup").unwrap_err();
    assert!(matches!(
        err,
        Error::ResumeKeyCompacted {
            requested: 1,
            earliest: 3
        }
    ));

    // A full resync clears the flag
    backlog
        .handshake("backup", &HandshakeRequest::first())
        .unwrap();
    assert_eq!(drain(&backlog, "backup"), vec![3, 4, 5]);
    assert!(backlog.health().is_healthy());
}

#[test]
fn test_detaching_last_channel_empties_log() {
    let backlog = backlog(BacklogConfig::default());
    attach_and_drain(&backlog, "backup");
    fill(&backlog, 4);
    backlog.detach_channel("backup").unwrap();

    assert_eq!(backlog.size(), 0);
    assert!(backlog.channels().is_empty());
    assert_eq!(backlog.add(write("dropped"), false).unwrap(), None);

    // Keys keep counting after the log was emptied
    attach_and_drain(&backlog, "backup");
    assert_eq!(fill(&backlog, 1), vec![5]);
}

#[test]
fn test_concurrent_producers_get_dense_keys() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;
    let total = (PRODUCERS * PER_PRODUCER) as u64;

    init_tracing();
    let backlog = backlog(BacklogConfig::default());
    attach_and_drain(&backlog, "backup");
    let size = backlog.size_probe();
    let done = AtomicBool::new(false);

    let mut keys: Vec<u64> = std::thread::scope(|s| {
        let watcher = s.spawn(|| {
            let mut last = 0;
            while !done.load(Ordering::Acquire) {
                let len = size.len();
                assert!(len >= last, "size went backwards: {} after {}", len, last);
                assert!(len <= total);
                last = len;
                std::thread::yield_now();
            }
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let backlog = &backlog;
                s.spawn(move || {
                    (0..PER_PRODUCER)
                        .map(|i| {
                            backlog
                                .add(write(&format!("p{}-{}", p, i)), false)
                                .unwrap()
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let keys = producers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        done.store(true, Ordering::Release);
        watcher.join().unwrap();
        keys
    });

    keys.sort_unstable();
    let expected: Vec<u64> = (1..=total).collect();
    assert_eq!(keys, expected);
    assert_eq!(size.len(), total);
    assert_eq!(backlog.size(), total);
    assert!(backlog.validate_integrity().is_ok());
    assert_eq!(drain(&backlog, "backup"), expected);
}

#[derive(Debug, Clone)]
enum Step {
    Add(usize),
    Deliver,
    Compact(usize),
    Reconnect,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1usize..4).prop_map(Step::Add),
        Just(Step::Deliver),
        (1usize..6).prop_map(Step::Compact),
        Just(Step::Reconnect),
    ]
}

proptest! {
    #[test]
    fn prop_keys_are_dense_and_monotonic(steps in prop::collection::vec(step(), 1..40)) {
        let backlog = backlog(BacklogConfig::default());
        attach_and_drain(&backlog, "backup");

        let mut issued = Vec::new();
        let mut delivered = Vec::new();
        for step in steps {
            match step {
                Step::Add(ops) => {
                    let key = backlog
                        .add_generic(weighted("p", ops), false, false)
                        .unwrap()
                        .unwrap();
                    issued.push(key);
                }
                Step::Deliver => {
                    let keys = drain(&backlog, "backup");
                    if let Some(&last) = keys.last() {
                        backlog.confirm("backup", last).unwrap();
                    }
                    delivered.extend(keys);
                }
                Step::Compact(max) => {
                    backlog.compact(max).unwrap();
                }
                Step::Reconnect => {
                    let confirmed = backlog.status("backup").unwrap().last_confirmed_key;
                    backlog.channel_disconnected("backup").unwrap();
                    let response = backlog
                        .handshake("backup", &HandshakeRequest::resume(confirmed))
                        .unwrap();
                    prop_assert_eq!(response.start_key, confirmed + 1);
                }
            }
        }
        delivered.extend(drain(&backlog, "backup"));

        let expected: Vec<u64> = (1..=issued.len() as u64).collect();
        prop_assert_eq!(&issued, &expected);
        prop_assert_eq!(delivered, expected);
    }

    #[test]
    fn prop_compaction_never_passes_frontier(
        total in 1u64..30,
        fast in 0u64..30,
        slow in 0u64..30,
    ) {
        let fast = fast.min(total);
        let slow = slow.min(total);
        let backlog = backlog(BacklogConfig::default());
        attach_and_drain(&backlog, "fast");
        attach_and_drain(&backlog, "slow");
        fill(&backlog, total as usize);
        drain(&backlog, "fast");
        drain(&backlog, "slow");
        backlog.confirm("fast", fast).unwrap();
        backlog.confirm("slow", slow).unwrap();

        let frontier = fast.min(slow);
        prop_assert_eq!(backlog.frontier(), Some(frontier));
        let result = backlog.compact(usize::MAX).unwrap();

        prop_assert_eq!(result.removed, frontier);
        prop_assert_eq!(backlog.size(), total - frontier);
        let expected_head = (frontier < total).then_some(frontier + 1);
        prop_assert_eq!(backlog.retained_range().first_key, expected_head);
    }

    #[test]
    fn prop_discard_oldest_bounds_weight(
        max_weight in 4u64..20,
        sizes in prop::collection::vec(1usize..4, 1..40),
    ) {
        let backlog = backlog(
            BacklogConfig::default()
                .with_max_weight(max_weight)
                .with_full_policy(BacklogFullPolicy::DiscardOldest),
        );
        attach_and_drain(&backlog, "backup");
        for ops in sizes {
            backlog.add_generic(weighted("p", ops), false, false).unwrap();
            prop_assert!(backlog.weight() <= max_weight);
        }
    }
}
