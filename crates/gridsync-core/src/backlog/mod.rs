//! Source-side group backlog
//!
//! The backlog of one group on one source member:
//! - Assigns order keys and appends packets to the group's packet log
//! - Feeds every channel, either from the log (catch-up) or from its batch
//!   accumulator (live)
//! - Tracks per-channel confirmations and applies backpressure
//! - Compacts the log up to the confirmation frontier
//!
//! # Locking
//!
//! Three locks, always taken in this order:
//!
//! ```text
//! append (Mutex)  ->  log (RwLock)  ->  channels (Mutex)
//! ```
//!
//! `append` serializes key assignment, handshakes and the catch-up to live
//! switch, so no packet can slip between a channel's last log read and its
//! first accumulated packet. [`SourceGroupBacklog::size`] reads a
//! [`LogSize`] probe and takes none of them.

pub mod batch;
pub mod channel;

pub use batch::BatchAccumulator;
pub use channel::{ChannelStatus, Cursor};

use crate::config::{
    BacklogConfig, BacklogFullPolicy, CompactionResult, GroupMembership,
};
use crate::confirmation::ConfirmationTracker;
use crate::error::{Error, PendingError, Result};
use crate::handshake::{ChannelState, RetainedRange, negotiate};
use crate::packet_log::{LogSize, MemoryPacketLog, PacketLogStorage};
use channel::OutboundChannel;
use gridsync_protocol::{
    BatchPacket, EntryOperation, HandshakeRequest, HandshakeResponse, OrderedPacket, Payload,
    TransactionData, TxnPhase,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Instant;

struct AppendState {
    next_key: u64,
}

#[derive(Default)]
struct ChannelTable {
    confirmations: ConfirmationTracker,
    outbound: HashMap<String, OutboundChannel>,
}

/// Health summary of a backlog
#[derive(Debug, Clone)]
pub struct BacklogHealth {
    /// Group name
    pub group: String,
    /// Retained packets
    pub size: u64,
    /// Retained weight
    pub weight: u64,
    /// Registered channels
    pub channels: usize,
    /// Errors pinned to keys not yet confirmed
    pub pending_errors: Vec<(String, PendingError)>,
    /// Channels that lost packets to discard-oldest
    pub resync_required: Vec<String>,
}

impl BacklogHealth {
    /// No pending errors and no channel awaiting resync
    pub fn is_healthy(&self) -> bool {
        self.pending_errors.is_empty() && self.resync_required.is_empty()
    }
}

/// Ordered packet backlog of one replication group
pub struct SourceGroupBacklog {
    group: String,
    config: BacklogConfig,
    membership: GroupMembership,
    append: Mutex<AppendState>,
    log: RwLock<Box<dyn PacketLogStorage>>,
    channels: Mutex<ChannelTable>,
    size: LogSize,
}

impl SourceGroupBacklog {
    /// Create a backlog over `log`
    ///
    /// Keys continue after the highest key the log ever held.
    pub fn new(
        membership: GroupMembership,
        config: BacklogConfig,
        log: Box<dyn PacketLogStorage>,
    ) -> Self {
        let group = membership.name();
        let next_key = log.last_appended_key().map_or(1, |k| k + 1);
        let size = log.size_probe();
        tracing::info!("Backlog for group {} starts at key {}", group, next_key);

        Self {
            group,
            config,
            membership,
            append: Mutex::new(AppendState { next_key }),
            log: RwLock::new(log),
            channels: Mutex::new(ChannelTable::default()),
            size,
        }
    }

    /// Create a backlog over an unbounded in-memory log
    pub fn in_memory(membership: GroupMembership, config: BacklogConfig) -> Self {
        let log = MemoryPacketLog::new(membership.name());
        Self::new(membership, config, Box::new(log))
    }

    /// Group name
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Backlog configuration
    pub fn config(&self) -> &BacklogConfig {
        &self.config
    }

    /// Retained packets; never blocks
    pub fn size(&self) -> u64 {
        self.size.len()
    }

    /// Retained weight; never blocks
    pub fn weight(&self) -> u64 {
        self.size.weight()
    }

    /// Cloneable lock-free size probe
    pub fn size_probe(&self) -> LogSize {
        self.size.clone()
    }

    /// Log a single entry operation
    ///
    /// Returns the assigned key, or `None` when no channel is registered and
    /// nothing was logged.
    pub fn add(&self, op: EntryOperation, transient: bool) -> Result<Option<u64>> {
        self.add_generic(Payload::Entry(op), transient, false)
    }

    /// Log a transaction phase
    pub fn add_transaction(&self, phase: TxnPhase, txn: TransactionData) -> Result<Option<u64>> {
        self.add_generic(Payload::Transaction(phase, txn), false, false)
    }

    /// Log any payload
    pub fn add_generic(
        &self,
        payload: Payload,
        transient: bool,
        from_gateway: bool,
    ) -> Result<Option<u64>> {
        let mut append = self.append.lock();
        if self.channels.lock().outbound.is_empty() {
            return Ok(None);
        }

        let key = append.next_key;
        let packet = OrderedPacket::new(key, payload)
            .transient(transient)
            .from_gateway(from_gateway);
        let weight = packet.weight as u64;

        let mut log = self.log.write();
        let threshold = self.config.max_weight;
        let projected = log.weight() + weight;
        if projected > threshold {
            match self.config.full_policy {
                BacklogFullPolicy::Reject => return Err(self.storage_full(projected)),
                BacklogFullPolicy::DiscardOldest => {
                    if weight > threshold {
                        return Err(self.storage_full(weight));
                    }
                    self.discard_oldest(&mut **log, projected - threshold)?;
                }
            }
        }

        log.append_batch(vec![packet.clone()])?;
        append.next_key = key + 1;

        let mut channels = self.channels.lock();
        let ChannelTable {
            confirmations,
            outbound,
        } = &mut *channels;
        for (name, ch) in outbound.iter_mut() {
            if let Some(state) = confirmations.get_mut(name) {
                state.add_weight(weight);
            }
            if ch.state == ChannelState::Active && ch.cursor == Cursor::Live {
                ch.accumulator.push(packet.clone());
            }
        }
        Ok(Some(key))
    }

    fn storage_full(&self, weight: u64) -> Error {
        Error::StorageFull {
            group: self.group.clone(),
            weight,
            threshold: self.config.max_weight,
        }
    }

    /// Drop head packets until at least `needed` weight is freed
    fn discard_oldest(&self, log: &mut dyn PacketLogStorage, needed: u64) -> Result<()> {
        let mut count = 0usize;
        let mut freed = 0u64;
        for packet in log.read_only_iterator(None)? {
            freed += packet?.weight as u64;
            count += 1;
            if freed >= needed {
                break;
            }
        }

        let removed = log.remove_first_batch(count, u64::MAX)?;
        let Some(last_removed) = removed.last().map(|p| p.key) else {
            return Ok(());
        };

        let mut channels = self.channels.lock();
        let ChannelTable {
            confirmations,
            outbound,
        } = &mut *channels;
        for (name, state) in confirmations.iter_mut() {
            let confirmed = state.last_confirmed_key();
            let (lost, lost_weight) = removed
                .iter()
                .filter(|p| p.key > confirmed)
                .fold((0u64, 0u64), |(n, w), p| (n + 1, w + p.weight as u64));
            if lost == 0 {
                continue;
            }
            state.record_discarded(lost, lost_weight);
            if let Some(ch) = outbound.get_mut(name) {
                ch.prune_discarded(last_removed);
                ch.resync_required = true;
            }
            tracing::warn!(
                "Group {}: channel {} lost {} unconfirmed packets (weight {}), resync required",
                self.group,
                name,
                lost,
                lost_weight
            );
        }

        tracing::warn!(
            "Group {}: backlog full, discarded {} oldest packets up to key {}",
            self.group,
            removed.len(),
            last_removed
        );
        Ok(())
    }

    /// Keys the backlog can still serve
    pub fn retained_range(&self) -> RetainedRange {
        let append = self.append.lock();
        let log = self.log.read();
        RetainedRange {
            first_key: log.first_key(),
            next_key: append.next_key,
        }
    }

    /// Negotiate where delivery to `target` starts and (re)register its channel
    ///
    /// A failed negotiation changes nothing.
    pub fn handshake(&self, target: &str, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        if !self.membership.allows_target(target) {
            return Err(Error::UnknownMember(format!(
                "target {} is not a member of group {}",
                target, self.group
            )));
        }

        let append = self.append.lock();
        let log = self.log.read();
        let range = RetainedRange {
            first_key: log.first_key(),
            next_key: append.next_key,
        };

        let mut response = match negotiate(request, range) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "Group {}: handshake from {} rejected: {}",
                    self.group,
                    target,
                    e
                );
                return Err(e);
            }
        };
        let start = response.start_key;

        let mut weight = 0u64;
        for packet in log.read_only_iterator(Some(start))? {
            weight += packet?.weight as u64;
        }

        let mut channels = self.channels.lock();
        let ChannelTable {
            confirmations,
            outbound,
        } = &mut *channels;

        let ch = outbound.entry(target.to_string()).or_insert_with(|| {
            OutboundChannel::new(BatchAccumulator::new(
                self.config.max_batch_size,
                self.config.max_batch_age,
            ))
        });
        if ch.state == ChannelState::Active {
            tracing::warn!(
                "Group {}: channel {} re-handshaking while active, dropping previous epoch",
                self.group,
                target
            );
            ch.state.transition(ChannelState::Disconnected)?;
        }
        ch.state.transition(ChannelState::Handshaking)?;

        let discarded = match confirmations.view(target) {
            Some(view) if !request.first_handshake => view.discarded_packets_count,
            _ => 0,
        };
        let state = confirmations.register(target, start.saturating_sub(1));
        state.set_weight(weight);
        state.record_discarded(discarded, 0);

        ch.reset(start);
        ch.consumer_state = request.reliable_async_state.clone();
        ch.handshakes += 1;
        response.reliable_async_state = ch.producer_state.clone();
        ch.state.transition(ChannelState::Active)?;

        tracing::info!(
            "Group {}: channel {} {} handshake complete, delivery starts at key {}",
            self.group,
            target,
            if request.first_handshake { "first" } else { "resume" },
            start
        );
        Ok(response)
    }

    /// Next batch for `target` if a size/age threshold is reached
    pub fn next_batch(&self, target: &str) -> Result<Option<BatchPacket>> {
        self.poll_batch(target, false)
    }

    /// Next batch for `target`, cutting the accumulator regardless of thresholds
    pub fn flush(&self, target: &str) -> Result<Option<BatchPacket>> {
        self.poll_batch(target, true)
    }

    fn poll_batch(&self, target: &str, force: bool) -> Result<Option<BatchPacket>> {
        let (cursor, resync_from) = {
            let channels = self.channels.lock();
            let ch = channels
                .outbound
                .get(target)
                .ok_or_else(|| self.unknown_channel(target))?;
            if ch.state != ChannelState::Active {
                return Err(Error::channel(format!(
                    "channel {} of group {} is {}",
                    target, self.group, ch.state
                )));
            }
            let resync_from = ch.resync_required.then(|| {
                channels
                    .confirmations
                    .view(target)
                    .map_or(1, |v| v.last_confirmed_key + 1)
            });
            (ch.cursor, resync_from)
        };

        if let Some(requested) = resync_from {
            let log = self.log.read();
            return Err(Error::ResumeKeyCompacted {
                requested,
                earliest: earliest_retained(&**log),
            });
        }

        match cursor {
            Cursor::CatchingUp { .. } => self.catch_up_batch(target),
            Cursor::Live => {
                let mut channels = self.channels.lock();
                let Some(ch) = channels.outbound.get_mut(target) else {
                    return Err(self.unknown_channel(target));
                };
                if ch.cursor != Cursor::Live {
                    return Ok(None);
                }
                let Some(packets) = ch.accumulator.poll(Instant::now(), force) else {
                    return Ok(None);
                };
                ch.record_sent(packets.iter().map(|p| (p.key, p.weight)));
                Ok(Some(BatchPacket::new(packets)))
            }
        }
    }

    fn catch_up_batch(&self, target: &str) -> Result<Option<BatchPacket>> {
        let _append = self.append.lock();
        let log = self.log.read();
        let mut channels = self.channels.lock();
        let Some(ch) = channels.outbound.get_mut(target) else {
            return Err(self.unknown_channel(target));
        };
        let Cursor::CatchingUp { next_key } = ch.cursor else {
            return Ok(None);
        };

        let earliest = earliest_retained(&**log);
        if next_key < earliest {
            ch.resync_required = true;
            return Err(Error::ResumeKeyCompacted {
                requested: next_key,
                earliest,
            });
        }

        let packets = log
            .read_only_iterator(Some(next_key))?
            .take(self.config.max_batch_size)
            .collect::<Result<Vec<_>>>()?;

        let last_read = packets.last().map(|p| p.key);
        ch.cursor = match (last_read, log.last_key()) {
            (Some(read), Some(tail)) if read < tail => Cursor::CatchingUp { next_key: read + 1 },
            _ => {
                tracing::debug!(
                    "Group {}: channel {} caught up at key {}",
                    self.group,
                    target,
                    last_read.unwrap_or(next_key.saturating_sub(1))
                );
                Cursor::Live
            }
        };

        if packets.is_empty() {
            return Ok(None);
        }
        ch.record_sent(packets.iter().map(|p| (p.key, p.weight)));
        Ok(Some(BatchPacket::new(packets)))
    }

    /// Acknowledge everything up to `key` for `target`
    ///
    /// Keys at or below the current confirmation are a no-op (`Ok(false)`);
    /// keys beyond what was sent are rejected.
    pub fn confirm(&self, target: &str, key: u64) -> Result<bool> {
        let mut channels = self.channels.lock();
        let ChannelTable {
            confirmations,
            outbound,
        } = &mut *channels;
        let ch = outbound
            .get_mut(target)
            .ok_or_else(|| self.unknown_channel(target))?;
        let state = confirmations
            .get_mut(target)
            .ok_or_else(|| self.unknown_channel(target))?;

        if key > ch.last_sent {
            return Err(Error::channel(format!(
                "channel {} acknowledged key {} beyond last sent {}",
                target, key, ch.last_sent
            )));
        }
        if !state.advance(key) {
            return Ok(false);
        }
        let confirmed_weight = ch.confirm_in_flight(key);
        state.sub_weight(confirmed_weight);
        Ok(true)
    }

    /// Pin `error` to `key` on the channel's confirmation state
    pub fn record_delivery_error(&self, target: &str, key: u64, error: Error) -> Result<bool> {
        let mut channels = self.channels.lock();
        let state = channels
            .confirmations
            .get_mut(target)
            .ok_or_else(|| self.unknown_channel(target))?;
        tracing::warn!(
            "Group {}: delivery error for channel {} at key {}: {}",
            self.group,
            target,
            key,
            error
        );
        Ok(state.set_pending_error(key, error))
    }

    /// Transport to `target` was lost; the channel stays registered for resume
    pub fn channel_disconnected(&self, target: &str) -> Result<()> {
        let mut channels = self.channels.lock();
        let ch = channels
            .outbound
            .get_mut(target)
            .ok_or_else(|| self.unknown_channel(target))?;
        match ch.state {
            ChannelState::Active | ChannelState::Handshaking => {
                ch.state.transition(ChannelState::Disconnected)?;
                ch.accumulator.clear();
                tracing::info!("Group {}: channel {} disconnected", self.group, target);
            }
            ChannelState::Disconnected | ChannelState::Closing => {}
        }
        Ok(())
    }

    /// Detach `target`: abort its in-flight batches and destroy its confirmation
    ///
    /// With no channel left the log is cleared.
    pub fn detach_channel(&self, target: &str) -> Result<()> {
        let _append = self.append.lock();
        let mut log = self.log.write();
        let mut channels = self.channels.lock();

        let Some(mut ch) = channels.outbound.remove(target) else {
            return Err(self.unknown_channel(target));
        };
        if ch.state == ChannelState::Active {
            ch.state.transition(ChannelState::Closing)?;
        }
        if ch.state != ChannelState::Disconnected {
            ch.state.transition(ChannelState::Disconnected)?;
        }
        channels.confirmations.remove(target);
        tracing::info!(
            "Group {}: channel {} detached ({} in flight aborted)",
            self.group,
            target,
            ch.in_flight.len()
        );

        if channels.outbound.is_empty() {
            if let Some(last) = log.last_key() {
                let removed = log.delete_oldest_packets(last)?;
                tracing::info!(
                    "Group {}: no channel left, cleared {} packets",
                    self.group,
                    removed
                );
            }
        }
        Ok(())
    }

    /// Set the reliable-async blob handed to `target` at its next handshake
    pub fn set_reliable_async_state(&self, target: &str, state: Vec<u8>) -> Result<()> {
        let mut channels = self.channels.lock();
        let ch = channels
            .outbound
            .get_mut(target)
            .ok_or_else(|| self.unknown_channel(target))?;
        ch.producer_state = Some(state);
        Ok(())
    }

    /// Reliable-async blob `target` reported at its last handshake
    pub fn reliable_async_state(&self, target: &str) -> Option<Vec<u8>> {
        let channels = self.channels.lock();
        channels
            .outbound
            .get(target)
            .and_then(|ch| ch.consumer_state.clone())
    }

    /// Lowest confirmed key over all channels
    pub fn frontier(&self) -> Option<u64> {
        self.channels.lock().confirmations.frontier()
    }

    /// Remove up to `max_packets` head packets confirmed by every channel
    ///
    /// With no channel registered nothing is removed: a reopened log keeps
    /// its packets until targets resume, and only `detach_channel` clears it.
    pub fn compact(&self, max_packets: usize) -> Result<CompactionResult> {
        let _append = self.append.lock();
        let mut log = self.log.write();
        let channels = self.channels.lock();

        let nothing = CompactionResult {
            remaining_weight: log.weight(),
            ..Default::default()
        };
        let Some(first) = log.first_key() else {
            return Ok(nothing);
        };
        let Some(frontier) = channels.confirmations.frontier() else {
            return Ok(nothing);
        };
        if frontier < first {
            return Ok(nothing);
        }

        let limit = max_packets.max(1) as u64;
        let to = frontier.min(first.saturating_add(limit - 1));
        let result = log.perform_compaction(first, to)?;
        if result.removed > 0 {
            tracing::debug!(
                "Group {}: compacted {} packets ({:?}), weight now {}",
                self.group,
                result.removed,
                result.range,
                result.remaining_weight
            );
        }
        Ok(result)
    }

    /// Status of one channel
    pub fn status(&self, target: &str) -> Option<ChannelStatus> {
        let channels = self.channels.lock();
        self.build_status(&channels, target)
    }

    /// Status of every channel, ordered by name
    pub fn channels(&self) -> Vec<ChannelStatus> {
        let channels = self.channels.lock();
        let mut names: Vec<&String> = channels.outbound.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.build_status(&channels, name))
            .collect()
    }

    /// Channel with the highest calculated weight
    pub fn heaviest_channel(&self) -> Option<ChannelStatus> {
        self.channels()
            .into_iter()
            .max_by_key(|status| status.calculated_weight)
    }

    fn build_status(&self, channels: &ChannelTable, target: &str) -> Option<ChannelStatus> {
        let ch = channels.outbound.get(target)?;
        let view = channels.confirmations.view(target)?;
        Some(ChannelStatus {
            name: target.to_string(),
            state: ch.state,
            cursor: ch.cursor,
            last_confirmed_key: view.last_confirmed_key,
            last_sent_key: ch.last_sent,
            in_flight: ch.in_flight.len(),
            accumulated: ch.accumulator.len(),
            weight: view.weight,
            discarded_packets_count: view.discarded_packets_count,
            calculated_weight: view.calculated_weight(self.config.discarded_packet_weight),
            resync_required: ch.resync_required,
            pending_error_key: view.pending_error_key,
            handshakes: ch.handshakes,
        })
    }

    /// Pending errors and resync needs
    pub fn health(&self) -> BacklogHealth {
        let channels = self.channels.lock();
        let mut pending_errors: Vec<(String, PendingError)> = channels
            .confirmations
            .iter()
            .filter_map(|(name, state)| {
                state
                    .pending_error()
                    .map(|pending| (name.to_string(), pending.clone()))
            })
            .collect();
        pending_errors.sort_by(|a, b| a.0.cmp(&b.0));
        let mut resync_required: Vec<String> = channels
            .outbound
            .iter()
            .filter(|(_, ch)| ch.resync_required)
            .map(|(name, _)| name.clone())
            .collect();
        resync_required.sort();

        BacklogHealth {
            group: self.group.clone(),
            size: self.size.len(),
            weight: self.size.weight(),
            channels: channels.outbound.len(),
            pending_errors,
            resync_required,
        }
    }

    /// Run the log's integrity check
    pub fn validate_integrity(&self) -> Result<()> {
        let mut log = self.log.write();
        log.validate_integrity().inspect_err(|e| {
            tracing::error!("Group {}: packet log failed validation: {}", self.group, e);
        })
    }

    /// Close the log; every later append fails
    pub fn close(&self) -> Result<()> {
        let _append = self.append.lock();
        let mut log = self.log.write();
        log.close()
    }

    fn unknown_channel(&self, target: &str) -> Error {
        Error::channel(format!(
            "no channel {} registered with group {}",
            target, self.group
        ))
    }
}

fn earliest_retained(log: &dyn PacketLogStorage) -> u64 {
    log.first_key()
        .unwrap_or_else(|| log.last_appended_key().map_or(1, |k| k + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use gridsync_protocol::EntryData;
    use std::time::Duration;

    fn write(uid: &str) -> EntryOperation {
        EntryOperation::Write(EntryData::new("Order", uid, 1, vec![1]))
    }

    fn backlog(config: BacklogConfig) -> SourceGroupBacklog {
        SourceGroupBacklog::in_memory(GroupMembership::new(GroupConfig::new("orders")), config)
    }

    fn batch_keys(batch: Option<BatchPacket>) -> Vec<u64> {
        batch
            .map(|b| b.packets.iter().map(|p| p.key).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_no_channel_no_logging() {
        let backlog = backlog(BacklogConfig::default());
        assert_eq!(backlog.add(write("a"), false).unwrap(), None);
        assert_eq!(backlog.size(), 0);

        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        assert_eq!(backlog.add(write("a"), false).unwrap(), Some(1));

        backlog.detach_channel("backup").unwrap();
        assert_eq!(backlog.size(), 0);
        assert_eq!(backlog.add(write("b"), false).unwrap(), None);
    }

    #[test]
    fn test_keys_are_monotonic() {
        let backlog = backlog(BacklogConfig::default());
        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        let keys: Vec<u64> = (0..10)
            .map(|i| backlog.add(write(&i.to_string()), false).unwrap().unwrap())
            .collect();
        assert!(keys.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_live_batches_follow_thresholds() {
        let config = BacklogConfig::default().with_batching(3, Duration::from_secs(60));
        let backlog = backlog(config);
        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        // Empty log: catch-up switches straight to live
        assert_eq!(backlog.next_batch("backup").unwrap(), None);

        backlog.add(write("a"), false).unwrap();
        backlog.add(write("b"), false).unwrap();
        assert_eq!(backlog.next_batch("backup").unwrap(), None);
        backlog.add(write("c"), false).unwrap();
        assert_eq!(batch_keys(backlog.next_batch("backup").unwrap()), vec![1, 2, 3]);

        backlog.add(write("d"), false).unwrap();
        assert_eq!(batch_keys(backlog.flush("backup").unwrap()), vec![4]);
    }

    #[test]
    fn test_confirm_rejects_unsent_keys() {
        let backlog = backlog(BacklogConfig::default());
        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        backlog.add(write("a"), false).unwrap();
        backlog.add(write("b"), false).unwrap();
        assert!(backlog.confirm("backup", 1).is_err());

        backlog.flush("backup").unwrap();
        assert!(backlog.confirm("backup", 2).unwrap());
        assert!(!backlog.confirm("backup", 1).unwrap());
        assert_eq!(backlog.status("backup").unwrap().last_confirmed_key, 2);
        assert_eq!(backlog.status("backup").unwrap().weight, 0);
    }

    #[test]
    fn test_reject_policy() {
        let config = BacklogConfig::default()
            .with_max_weight(3)
            .with_full_policy(BacklogFullPolicy::Reject);
        let backlog = backlog(config);
        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        for uid in ["a", "b", "c"] {
            backlog.add(write(uid), false).unwrap();
        }
        assert!(matches!(
            backlog.add(write("d"), false),
            Err(Error::StorageFull { .. })
        ));
        assert_eq!(backlog.size(), 3);
    }

    #[test]
    fn test_discard_oldest_policy() {
        let config = BacklogConfig::default()
            .with_max_weight(3)
            .with_full_policy(BacklogFullPolicy::DiscardOldest);
        let backlog = backlog(config);
        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        for uid in ["a", "b", "c", "d", "e"] {
            backlog.add(write(uid), false).unwrap();
        }
        assert_eq!(backlog.size(), 3);
        assert_eq!(backlog.retained_range().first_key, Some(3));

        let status = backlog.status("backup").unwrap();
        assert_eq!(status.discarded_packets_count, 2);
        assert_eq!(status.weight, 3);
        assert_eq!(status.calculated_weight, 5);
        assert!(status.resync_required);
        assert!(matches!(
            backlog.next_batch("backup"),
            Err(Error::ResumeKeyCompacted { .. })
        ));
        assert!(!backlog.health().is_healthy());
    }

    #[test]
    fn test_unknown_target_rejected_by_membership() {
        let membership =
            GroupMembership::new(GroupConfig::new("orders").with_targets(["backup-1"]));
        let backlog = SourceGroupBacklog::in_memory(membership, BacklogConfig::default());
        assert!(matches!(
            backlog.handshake("intruder", &HandshakeRequest::first()),
            Err(Error::UnknownMember(_))
        ));
        assert!(backlog.handshake("backup-1", &HandshakeRequest::first()).is_ok());
    }

    #[test]
    fn test_failed_handshake_registers_nothing() {
        let backlog = backlog(BacklogConfig::default());
        assert!(backlog.handshake("backup", &HandshakeRequest::resume(7)).is_err());
        assert!(backlog.status("backup").is_none());
        assert_eq!(backlog.add(write("a"), false).unwrap(), None);
    }

    #[test]
    fn test_reliable_async_state_round_trip() {
        let backlog = backlog(BacklogConfig::default());
        backlog
            .handshake("backup", &HandshakeRequest::first().with_state(vec![1, 2]))
            .unwrap();
        assert_eq!(backlog.reliable_async_state("backup"), Some(vec![1, 2]));

        backlog.set_reliable_async_state("backup", vec![9]).unwrap();
        backlog.channel_disconnected("backup").unwrap();
        let response = backlog
            .handshake("backup", &HandshakeRequest::resume(0))
            .unwrap();
        assert_eq!(response.reliable_async_state, Some(vec![9]));
    }

    #[test]
    fn test_pending_error_surfaces_in_health() {
        let backlog = backlog(BacklogConfig::default());
        backlog.handshake("backup", &HandshakeRequest::first()).unwrap();
        backlog.add(write("a"), false).unwrap();
        backlog.flush("backup").unwrap();
        backlog
            .record_delivery_error("backup", 1, Error::transport("reset"))
            .unwrap();
        assert_eq!(backlog.health().pending_errors.len(), 1);

        backlog.confirm("backup", 1).unwrap();
        assert!(backlog.health().is_healthy());
    }
}
