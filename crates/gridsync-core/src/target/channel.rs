//! Target end of one replication channel

use crate::applier::{ApplyError, ReplicaApplier};
use crate::conflict::{ConflictPolicy, Resolution};
use crate::confirmation::{ConfirmationState, ConfirmationView};
use crate::error::{Error, Result};
use crate::handshake::ChannelState;
use gridsync_protocol::{
    BatchPacket, EntryOperation, HandshakeRequest, HandshakeResponse, OperationKind,
    OrderedPacket, Payload, TxnPhase,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Counters of one target channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChannelStats {
    /// Packets received in order
    pub packets_received: u64,
    /// Entry operations applied
    pub applied: u64,
    /// Packets at or below the last received key
    pub replayed: u64,
    /// Conflicts ignored by policy
    pub ignored: u64,
    /// Conflicts reported by policy
    pub reported: u64,
    /// Conflicts resolved by overwriting
    pub overwritten: u64,
    /// Completed handshakes
    pub handshakes: u64,
}

/// Bulk operations buffered until the bulk ends
#[derive(Debug)]
struct BulkContext {
    bulk_id: u64,
    packets: Vec<OrderedPacket>,
}

impl BulkContext {
    fn first_key(&self) -> Option<u64> {
        self.packets.first().map(|p| p.key)
    }
}

/// Receiving side of a channel from one source into one group
pub struct TargetChannel {
    group: String,
    source: String,
    session_id: Uuid,
    state: ChannelState,
    confirmation: ConfirmationState,
    last_received: u64,
    first_handshake_pending: bool,
    applier: Arc<dyn ReplicaApplier>,
    policy: ConflictPolicy,
    staged: HashMap<u64, Vec<EntryOperation>>,
    bulk: Option<BulkContext>,
    consumer_state: Option<Vec<u8>>,
    producer_state: Option<Vec<u8>>,
    stats: TargetChannelStats,
}

impl TargetChannel {
    /// Create a channel with no prior state; its first handshake discards
    /// whatever the group holds locally
    pub fn new(
        group: impl Into<String>,
        source: impl Into<String>,
        applier: Arc<dyn ReplicaApplier>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            group: group.into(),
            source: source.into(),
            session_id: Uuid::new_v4(),
            state: ChannelState::Disconnected,
            confirmation: ConfirmationState::new(0),
            last_received: 0,
            first_handshake_pending: true,
            applier,
            policy,
            staged: HashMap::new(),
            bulk: None,
            consumer_state: None,
            producer_state: None,
            stats: TargetChannelStats::default(),
        }
    }

    /// Group name
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Source feeding this channel
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Id of the current connection epoch
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Read-only confirmation view
    pub fn confirmation(&self) -> ConfirmationView {
        self.confirmation.view()
    }

    /// Highest key applied (or deliberately ignored) and acknowledged
    pub fn last_confirmed_key(&self) -> u64 {
        self.confirmation.last_confirmed_key()
    }

    /// Counters
    pub fn stats(&self) -> &TargetChannelStats {
        &self.stats
    }

    /// Reliable-async state reported to the source at the next handshake
    pub fn set_reliable_async_state(&mut self, state: Vec<u8>) {
        self.consumer_state = Some(state);
    }

    /// Reliable-async state the source handed over at the last handshake
    pub fn producer_state(&self) -> Option<&[u8]> {
        self.producer_state.as_deref()
    }

    /// Forget the resume point; the next handshake is a first handshake
    pub fn require_full_resync(&mut self) {
        tracing::warn!(
            "Group {}: channel from {} requires full resync",
            self.group,
            self.source
        );
        self.first_handshake_pending = true;
    }

    /// Start a handshake and build the request for the source
    pub fn handshake_request(&mut self) -> Result<HandshakeRequest> {
        if self.state == ChannelState::Active {
            self.disconnect();
        }
        self.state.transition(ChannelState::Handshaking)?;

        let request = if self.first_handshake_pending {
            HandshakeRequest::first()
        } else {
            HandshakeRequest::resume(self.confirmation.last_confirmed_key())
        };
        Ok(match &self.consumer_state {
            Some(state) => request.with_state(state.clone()),
            None => request,
        })
    }

    /// Apply the source's answer and become active
    ///
    /// A resume answer that does not continue right after the local
    /// confirmation is refused and the channel drops back to disconnected.
    pub fn complete_handshake(&mut self, response: &HandshakeResponse) -> Result<()> {
        if self.state != ChannelState::Handshaking {
            return Err(Error::channel(format!(
                "group {}: handshake reply while {}",
                self.group, self.state
            )));
        }
        let start = response.start_key;
        if start == 0 {
            self.state.transition(ChannelState::Disconnected)?;
            return Err(Error::handshake("start key 0 is never issued"));
        }

        if response.discard_local_state {
            if let Err(e) = self.applier.clear_group(&self.group) {
                self.state.transition(ChannelState::Disconnected)?;
                return Err(Error::apply(e.to_string()));
            }
            self.staged.clear();
            self.confirmation = ConfirmationState::new(start - 1);
        } else if start != self.confirmation.last_confirmed_key() + 1 {
            self.state.transition(ChannelState::Disconnected)?;
            return Err(Error::handshake(format!(
                "group {}: source resumes at {} but last confirmed key is {}",
                self.group,
                start,
                self.confirmation.last_confirmed_key()
            )));
        }

        self.bulk = None;
        self.last_received = start - 1;
        self.producer_state = response.reliable_async_state.clone();
        self.first_handshake_pending = false;
        self.session_id = Uuid::new_v4();
        self.stats.handshakes += 1;
        self.state.transition(ChannelState::Active)?;

        tracing::info!(
            "Group {}: channel from {} active at key {} (session {}, discard {})",
            self.group,
            self.source,
            start,
            self.session_id,
            response.discard_local_state
        );
        Ok(())
    }

    /// Connection lost; buffered bulk packets are dropped and resent later
    pub fn disconnect(&mut self) {
        if matches!(self.state, ChannelState::Active | ChannelState::Handshaking) {
            self.state = ChannelState::Disconnected;
        }
        if let Some(bulk) = self.bulk.take() {
            tracing::debug!(
                "Group {}: dropping {} buffered packets of bulk {}",
                self.group,
                bulk.packets.len(),
                bulk.bulk_id
            );
        }
        self.last_received = self.confirmation.last_confirmed_key();
    }

    /// Consume a batch; returns the key to acknowledge
    pub fn consume_batch(&mut self, batch: &BatchPacket) -> Result<u64> {
        for packet in &batch.packets {
            self.consume(packet)?;
        }
        Ok(self.confirmation.last_confirmed_key())
    }

    /// Consume one packet; returns the key to acknowledge
    pub fn consume(&mut self, packet: &OrderedPacket) -> Result<u64> {
        if self.state != ChannelState::Active {
            return Err(Error::channel(format!(
                "group {}: packet {} received while {}",
                self.group, packet.key, self.state
            )));
        }

        let expected = self.last_received + 1;
        if packet.key > expected {
            return Err(Error::channel(format!(
                "group {}: gap in delivery, expected key {} got {}",
                self.group, expected, packet.key
            )));
        }
        if packet.key < expected {
            self.replay(packet)?;
            return Ok(self.confirmation.last_confirmed_key());
        }

        self.stats.packets_received += 1;
        match packet_bulk_id(packet) {
            Some(bulk_id) => {
                if self.bulk.as_ref().is_some_and(|b| b.bulk_id != bulk_id) {
                    self.flush_bulk()?;
                }
                self.bulk
                    .get_or_insert_with(|| BulkContext {
                        bulk_id,
                        packets: Vec::new(),
                    })
                    .packets
                    .push(packet.clone());
            }
            None => {
                self.flush_bulk()?;
                self.apply_packet(packet)?;
            }
        }
        self.last_received = packet.key;

        let confirmable = match self.bulk.as_ref().and_then(BulkContext::first_key) {
            Some(first) => first - 1,
            None => self.last_received,
        };
        self.confirmation.advance(confirmable);
        Ok(self.confirmation.last_confirmed_key())
    }

    /// Apply and close the open bulk context
    pub fn flush_bulk(&mut self) -> Result<()> {
        let Some(bulk) = self.bulk.take() else {
            return Ok(());
        };
        tracing::debug!(
            "Group {}: applying bulk {} ({} packets)",
            self.group,
            bulk.bulk_id,
            bulk.packets.len()
        );
        for packet in &bulk.packets {
            self.apply_packet(packet)?;
        }
        if let Some(last) = bulk.packets.last() {
            self.confirmation.advance(last.key);
        }
        Ok(())
    }

    fn replay(&mut self, packet: &OrderedPacket) -> Result<()> {
        self.stats.replayed += 1;
        if let Some(first) = self.bulk.as_ref().and_then(BulkContext::first_key) {
            if packet.key >= first {
                return Ok(());
            }
        }
        if matches!(packet.payload, Payload::Transaction(..))
            && packet.key <= self.confirmation.last_confirmed_key()
        {
            tracing::debug!(
                "Group {}: skipping confirmed transaction phase at key {}",
                self.group,
                packet.key
            );
            return Ok(());
        }
        tracing::debug!(
            "Group {}: replaying key {} (last received {})",
            self.group,
            packet.key,
            self.last_received
        );
        self.apply_packet(packet)
    }

    fn apply_packet(&mut self, packet: &OrderedPacket) -> Result<()> {
        let (key, transient) = (packet.key, packet.transient);
        match &packet.payload {
            Payload::Entry(op) => self.apply_operation(key, op, transient),
            Payload::Batch(ops) => {
                for op in ops {
                    self.apply_operation(key, op, transient)?;
                }
                Ok(())
            }
            Payload::Transaction(TxnPhase::Prepare, txn) => {
                self.staged.insert(txn.txn_id, txn.operations.clone());
                Ok(())
            }
            Payload::Transaction(TxnPhase::Commit, txn) => {
                let staged = self.staged.remove(&txn.txn_id);
                let operations = match staged {
                    Some(ops) if txn.operations.is_empty() => ops,
                    _ => txn.operations.clone(),
                };
                if operations.is_empty() {
                    tracing::warn!(
                        "Group {}: commit of transaction {} at key {} carries no operations",
                        self.group,
                        txn.txn_id,
                        key
                    );
                }
                for op in &operations {
                    self.apply_operation(key, op, transient)?;
                }
                Ok(())
            }
            Payload::Transaction(TxnPhase::Abort, txn) => {
                if self.staged.remove(&txn.txn_id).is_some() {
                    tracing::debug!("Group {}: transaction {} aborted", self.group, txn.txn_id);
                }
                Ok(())
            }
            Payload::TypeIndex(index) => {
                let result = self.applier.add_type_index(index);
                self.settle(key, OperationKind::AddTypeIndex, result, transient, None)
            }
            Payload::TypeIntroduce(descriptor) => {
                let result = self.applier.introduce_type(descriptor);
                self.settle(key, OperationKind::IntroduceType, result, transient, None)
            }
        }
    }

    fn apply_operation(&mut self, key: u64, op: &EntryOperation, transient: bool) -> Result<()> {
        let result = self.applier.apply(op, transient);
        self.settle(key, op.kind(), result, transient, Some(op))
    }

    fn settle(
        &mut self,
        key: u64,
        kind: OperationKind,
        result: std::result::Result<(), ApplyError>,
        transient: bool,
        op: Option<&EntryOperation>,
    ) -> Result<()> {
        let conflict = match result {
            Ok(()) => {
                self.stats.applied += 1;
                return Ok(());
            }
            Err(ApplyError::Fatal(msg)) => {
                tracing::error!(
                    "Group {}: failed to apply key {} from {}: {}",
                    self.group,
                    key,
                    self.source,
                    msg
                );
                return Err(Error::apply(msg));
            }
            Err(ApplyError::Conflict(conflict)) => conflict,
        };

        match self
            .policy
            .resolve(&self.group, key, kind, &conflict, transient)
        {
            Resolution::Apply => {
                if let Some(op) = op {
                    self.applier
                        .overwrite(op)
                        .map_err(|e| Error::apply(e.to_string()))?;
                }
                self.stats.overwritten += 1;
            }
            Resolution::Ignore(_) => self.stats.ignored += 1,
            Resolution::Report(_) => self.stats.reported += 1,
        }
        Ok(())
    }
}

fn packet_bulk_id(packet: &OrderedPacket) -> Option<u64> {
    match &packet.payload {
        Payload::Entry(op) => op.bulk_id(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::InMemoryReplica;
    use gridsync_protocol::{ChangeData, EntryData, TransactionData};

    fn write(key: u64, uid: &str) -> OrderedPacket {
        OrderedPacket::new(
            key,
            Payload::Entry(EntryOperation::Write(EntryData::new("Order", uid, 1, vec![]))),
        )
    }

    fn bulk_write(key: u64, uid: &str, bulk: u64) -> OrderedPacket {
        OrderedPacket::new(
            key,
            Payload::Entry(EntryOperation::Write(
                EntryData::new("Order", uid, 1, vec![]).in_bulk(bulk),
            )),
        )
    }

    fn active_channel() -> (TargetChannel, Arc<InMemoryReplica>) {
        let replica = Arc::new(InMemoryReplica::new());
        let mut channel =
            TargetChannel::new("orders", "primary", replica.clone(), ConflictPolicy::default());
        let request = channel.handshake_request().unwrap();
        assert!(request.first_handshake);
        channel
            .complete_handshake(&HandshakeResponse {
                start_key: 1,
                discard_local_state: true,
                reliable_async_state: None,
            })
            .unwrap();
        (channel, replica)
    }

    #[test]
    fn test_in_order_consumption() {
        let (mut channel, replica) = active_channel();
        assert_eq!(channel.consume(&write(1, "a")).unwrap(), 1);
        assert_eq!(channel.consume(&write(2, "b")).unwrap(), 2);
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn test_gap_is_rejected() {
        let (mut channel, _) = active_channel();
        channel.consume(&write(1, "a")).unwrap();
        assert!(matches!(channel.consume(&write(3, "c")), Err(Error::Channel(_))));
        assert_eq!(channel.last_confirmed_key(), 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (mut channel, replica) = active_channel();
        for (key, uid) in [(1, "a"), (2, "b"), (3, "c")] {
            channel.consume(&write(key, uid)).unwrap();
        }
        assert_eq!(channel.consume(&write(2, "b")).unwrap(), 3);
        assert_eq!(replica.len(), 3);
        assert_eq!(channel.stats().replayed, 1);
        assert_eq!(channel.stats().ignored, 1);
    }

    #[test]
    fn test_two_phase_transaction() {
        let (mut channel, replica) = active_channel();
        let ops = vec![EntryOperation::Write(EntryData::new("Order", "t1", 1, vec![]))];
        let prepare = OrderedPacket::new(
            1,
            Payload::Transaction(
                TxnPhase::Prepare,
                TransactionData {
                    txn_id: 9,
                    operations: ops,
                },
            ),
        );
        let commit = OrderedPacket::new(
            2,
            Payload::Transaction(
                TxnPhase::Commit,
                TransactionData {
                    txn_id: 9,
                    operations: vec![],
                },
            ),
        );
        channel.consume(&prepare).unwrap();
        assert!(replica.is_empty());
        channel.consume(&commit).unwrap();
        assert!(replica.contains("t1"));
    }

    #[test]
    fn test_replayed_transaction_is_not_restaged() {
        let (mut channel, replica) = active_channel();
        let ops = vec![EntryOperation::Write(EntryData::new("Order", "t1", 1, vec![]))];
        let prepare = OrderedPacket::new(
            1,
            Payload::Transaction(
                TxnPhase::Prepare,
                TransactionData {
                    txn_id: 9,
                    operations: ops,
                },
            ),
        );
        let commit = OrderedPacket::new(
            2,
            Payload::Transaction(
                TxnPhase::Commit,
                TransactionData {
                    txn_id: 9,
                    operations: vec![],
                },
            ),
        );
        channel.consume(&prepare).unwrap();
        channel.consume(&commit).unwrap();
        assert!(channel.staged.is_empty());

        assert_eq!(channel.consume(&prepare).unwrap(), 2);
        assert_eq!(channel.consume(&commit).unwrap(), 2);
        assert!(channel.staged.is_empty());
        assert_eq!(channel.stats().replayed, 2);
        assert_eq!(channel.stats().ignored, 0);
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn test_replayed_change_is_silent() {
        let (mut channel, replica) = active_channel();
        let change = OrderedPacket::new(
            2,
            Payload::Entry(EntryOperation::Change(ChangeData {
                type_name: "Order".into(),
                uid: "a".into(),
                previous_version: 1,
                version: 2,
                changes: vec![("status".into(), vec![1])],
                bulk_id: None,
            })),
        );
        channel.consume(&write(1, "a")).unwrap();
        channel.consume(&change).unwrap();
        assert_eq!(channel.consume(&change).unwrap(), 2);

        assert_eq!(replica.get("a").unwrap().version, 2);
        assert_eq!(channel.stats().replayed, 1);
        assert_eq!(channel.stats().reported, 0);
        assert_eq!(channel.stats().ignored, 0);
    }

    #[test]
    fn test_bulk_holds_confirmation() {
        let (mut channel, replica) = active_channel();
        channel.consume(&write(1, "a")).unwrap();
        assert_eq!(channel.consume(&bulk_write(2, "b", 7)).unwrap(), 1);
        assert_eq!(channel.consume(&bulk_write(3, "c", 7)).unwrap(), 1);
        assert!(!replica.contains("b"));

        assert_eq!(channel.consume(&write(4, "d")).unwrap(), 4);
        assert!(replica.contains("b") && replica.contains("c"));
    }

    #[test]
    fn test_resume_request_after_disconnect() {
        let (mut channel, _) = active_channel();
        channel.consume(&write(1, "a")).unwrap();
        channel.disconnect();
        channel.set_reliable_async_state(vec![3]);

        let request = channel.handshake_request().unwrap();
        assert!(!request.first_handshake);
        assert_eq!(request.last_confirmed_key, 1);
        assert_eq!(request.reliable_async_state, Some(vec![3]));

        let bad = HandshakeResponse {
            start_key: 5,
            discard_local_state: false,
            reliable_async_state: None,
        };
        assert!(matches!(channel.complete_handshake(&bad), Err(Error::Handshake(_))));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_full_resync_clears_group() {
        let (mut channel, replica) = active_channel();
        channel.consume(&write(1, "a")).unwrap();
        channel.require_full_resync();
        let request = channel.handshake_request().unwrap();
        assert!(request.first_handshake);
        channel
            .complete_handshake(&HandshakeResponse {
                start_key: 10,
                discard_local_state: true,
                reliable_async_state: Some(vec![1]),
            })
            .unwrap();
        assert!(replica.is_empty());
        assert_eq!(channel.last_confirmed_key(), 9);
        assert_eq!(channel.producer_state(), Some(&[1u8][..]));
    }
}
