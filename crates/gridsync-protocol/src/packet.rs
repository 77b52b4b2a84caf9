//! Replicated operation packets
//!
//! A packet is a single tagged union: the payload variant determines the
//! operation kind, so a packet can never carry a kind that disagrees with its
//! contents. Each payload variant has its own encode/decode arm; the payload
//! bytes are bincode and travel inside the length-prefixed packet body.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Operation kind codes as they appear on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Entry written
    Write = 1,
    /// Entry replaced
    Update = 2,
    /// Entry removed
    Take = 3,
    /// Partial field change
    Change = 4,
    /// Transaction prepared (two-phase)
    TxnPrepare = 5,
    /// Transaction committed
    TxnCommit = 6,
    /// Transaction aborted
    TxnAbort = 7,
    /// Non-transactional batch of entry operations
    Batch = 8,
    /// Index added to a type
    AddTypeIndex = 9,
    /// Type metadata introduced
    IntroduceType = 10,
}

impl TryFrom<u8> for OperationKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Write),
            2 => Ok(Self::Update),
            3 => Ok(Self::Take),
            4 => Ok(Self::Change),
            5 => Ok(Self::TxnPrepare),
            6 => Ok(Self::TxnCommit),
            7 => Ok(Self::TxnAbort),
            8 => Ok(Self::Batch),
            9 => Ok(Self::AddTypeIndex),
            10 => Ok(Self::IntroduceType),
            other => Err(ProtocolError::UnknownOperationKind(other)),
        }
    }
}

impl OperationKind {
    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True for the kinds that touch a single entry
    pub fn is_entry_operation(self) -> bool {
        matches!(self, Self::Write | Self::Update | Self::Take | Self::Change)
    }
}

/// Phase of a replicated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnPhase {
    /// Operations staged, not yet visible
    Prepare,
    /// Operations made visible
    Commit,
    /// Staged operations dropped
    Abort,
}

/// Full entry image carried by write/update/take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    /// Type (class) name of the entry
    pub type_name: String,
    /// Entry unique id
    pub uid: String,
    /// Entry version after the operation
    pub version: u64,
    /// Serialized entry body
    pub data: Vec<u8>,
    /// Bulk this operation belongs to, if any
    pub bulk_id: Option<u64>,
}

impl EntryData {
    /// Create entry data without a bulk id
    pub fn new(
        type_name: impl Into<String>,
        uid: impl Into<String>,
        version: u64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            uid: uid.into(),
            version,
            data,
            bulk_id: None,
        }
    }

    /// Attach a bulk id
    pub fn in_bulk(mut self, bulk_id: u64) -> Self {
        self.bulk_id = Some(bulk_id);
        self
    }
}

/// Partial update of an entry's fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeData {
    /// Type (class) name of the entry
    pub type_name: String,
    /// Entry unique id
    pub uid: String,
    /// Version the change was computed against
    pub previous_version: u64,
    /// Version after the change
    pub version: u64,
    /// Changed fields as (name, serialized value)
    pub changes: Vec<(String, Vec<u8>)>,
    /// Bulk this operation belongs to, if any
    pub bulk_id: Option<u64>,
}

/// One operation against one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOperation {
    /// Insert
    Write(EntryData),
    /// Replace
    Update(EntryData),
    /// Remove
    Take(EntryData),
    /// Field-level change
    Change(ChangeData),
}

impl EntryOperation {
    /// Operation kind of this entry operation
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Write(_) => OperationKind::Write,
            Self::Update(_) => OperationKind::Update,
            Self::Take(_) => OperationKind::Take,
            Self::Change(_) => OperationKind::Change,
        }
    }

    /// Entry uid
    pub fn uid(&self) -> &str {
        match self {
            Self::Write(e) | Self::Update(e) | Self::Take(e) => &e.uid,
            Self::Change(c) => &c.uid,
        }
    }

    /// Type name of the entry
    pub fn type_name(&self) -> &str {
        match self {
            Self::Write(e) | Self::Update(e) | Self::Take(e) => &e.type_name,
            Self::Change(c) => &c.type_name,
        }
    }

    /// Bulk id, if the operation is part of a bulk
    pub fn bulk_id(&self) -> Option<u64> {
        match self {
            Self::Write(e) | Self::Update(e) | Self::Take(e) => e.bulk_id,
            Self::Change(c) => c.bulk_id,
        }
    }
}

/// Transaction body shared by prepare/commit/abort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    /// Transaction id, unique per source
    pub txn_id: u64,
    /// Operations of the transaction (empty for abort and for a commit of a
    /// previously prepared transaction)
    pub operations: Vec<EntryOperation>,
}

/// Index definition added to a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeIndexData {
    /// Indexed type
    pub type_name: String,
    /// Indexed property paths
    pub index_names: Vec<String>,
}

/// Type metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Type name
    pub type_name: String,
    /// Super type, if any
    pub super_type: Option<String>,
    /// Declared property names
    pub properties: Vec<String>,
}

/// Packet payload, one variant per operation family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Single entry operation
    Entry(EntryOperation),
    /// Transaction phase
    Transaction(TxnPhase, TransactionData),
    /// Non-transactional batch
    Batch(Vec<EntryOperation>),
    /// Index addition
    TypeIndex(TypeIndexData),
    /// Type introduction
    TypeIntroduce(TypeDescriptor),
}

impl Payload {
    /// Operation kind implied by this payload
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Entry(op) => op.kind(),
            Self::Transaction(TxnPhase::Prepare, _) => OperationKind::TxnPrepare,
            Self::Transaction(TxnPhase::Commit, _) => OperationKind::TxnCommit,
            Self::Transaction(TxnPhase::Abort, _) => OperationKind::TxnAbort,
            Self::Batch(_) => OperationKind::Batch,
            Self::TypeIndex(_) => OperationKind::AddTypeIndex,
            Self::TypeIntroduce(_) => OperationKind::IntroduceType,
        }
    }

    /// Number of entry operations carried, at least 1
    pub fn default_weight(&self) -> u32 {
        let ops = match self {
            Self::Entry(_) => 1,
            Self::Transaction(_, txn) => txn.operations.len(),
            Self::Batch(ops) => ops.len(),
            Self::TypeIndex(_) | Self::TypeIntroduce(_) => 1,
        };
        ops.max(1).min(u32::MAX as usize) as u32
    }

    /// Encode the kind-specific payload bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Entry(EntryOperation::Write(e))
            | Self::Entry(EntryOperation::Update(e))
            | Self::Entry(EntryOperation::Take(e)) => bincode::serialize(e)?,
            Self::Entry(EntryOperation::Change(c)) => bincode::serialize(c)?,
            Self::Transaction(_, txn) => bincode::serialize(txn)?,
            Self::Batch(ops) => bincode::serialize(ops)?,
            Self::TypeIndex(index) => bincode::serialize(index)?,
            Self::TypeIntroduce(desc) => bincode::serialize(desc)?,
        };
        Ok(bytes)
    }

    /// Decode payload bytes for the given kind
    pub fn decode(kind: OperationKind, bytes: &[u8]) -> Result<Self> {
        let payload = match kind {
            OperationKind::Write => Self::Entry(EntryOperation::Write(bincode::deserialize(bytes)?)),
            OperationKind::Update => {
                Self::Entry(EntryOperation::Update(bincode::deserialize(bytes)?))
            }
            OperationKind::Take => Self::Entry(EntryOperation::Take(bincode::deserialize(bytes)?)),
            OperationKind::Change => {
                Self::Entry(EntryOperation::Change(bincode::deserialize(bytes)?))
            }
            OperationKind::TxnPrepare => {
                Self::Transaction(TxnPhase::Prepare, bincode::deserialize(bytes)?)
            }
            OperationKind::TxnCommit => {
                Self::Transaction(TxnPhase::Commit, bincode::deserialize(bytes)?)
            }
            OperationKind::TxnAbort => {
                Self::Transaction(TxnPhase::Abort, bincode::deserialize(bytes)?)
            }
            OperationKind::Batch => Self::Batch(bincode::deserialize(bytes)?),
            OperationKind::AddTypeIndex => Self::TypeIndex(bincode::deserialize(bytes)?),
            OperationKind::IntroduceType => Self::TypeIntroduce(bincode::deserialize(bytes)?),
        };
        Ok(payload)
    }
}

/// An operation with its position in the group's replication order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedPacket {
    /// Group-scoped, strictly increasing order key
    pub key: u64,
    /// Retention cost of this packet
    pub weight: u32,
    /// Entry is transient (not persisted by central stores)
    pub transient: bool,
    /// Operation originated from a gateway
    pub from_gateway: bool,
    /// Operation body
    pub payload: Payload,
}

impl OrderedPacket {
    /// Create a packet with the payload's default weight
    pub fn new(key: u64, payload: Payload) -> Self {
        Self {
            key,
            weight: payload.default_weight(),
            transient: false,
            from_gateway: false,
            payload,
        }
    }

    /// Override the weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Mark the packet transient
    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// Mark the packet as gateway-originated
    pub fn from_gateway(mut self, from_gateway: bool) -> Self {
        self.from_gateway = from_gateway;
        self
    }

    /// Operation kind
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }
}

/// Ordered packets shipped together; keys live on the contained packets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPacket {
    /// Packets in key order
    pub packets: Vec<OrderedPacket>,
}

impl BatchPacket {
    /// Wrap packets
    pub fn new(packets: Vec<OrderedPacket>) -> Self {
        Self { packets }
    }

    /// Key of the first packet
    pub fn first_key(&self) -> Option<u64> {
        self.packets.first().map(|p| p.key)
    }

    /// Key of the last packet
    pub fn last_key(&self) -> Option<u64> {
        self.packets.last().map(|p| p.key)
    }

    /// Number of packets
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True when the batch carries nothing
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Sum of packet weights
    pub fn weight(&self) -> u64 {
        self.packets.iter().map(|p| p.weight as u64).sum()
    }
}
