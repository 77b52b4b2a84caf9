//! Replica-side grid mutation
//!
//! [`ReplicaApplier`] is what a target channel calls to make a replicated
//! operation visible. Conditions the conflict policy knows how to handle come
//! back as [`ApplyError::Conflict`]; anything else is [`ApplyError::Fatal`].

use crate::conflict::Conflict;
use gridsync_protocol::{EntryOperation, TypeDescriptor, TypeIndexData};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Failure to apply a replicated operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Local state conflicts with the operation
    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// Replica cannot apply anything
    #[error("{0}")]
    Fatal(String),
}

/// Grid mutations a target performs for one group
pub trait ReplicaApplier: Send + Sync {
    /// Apply an entry operation
    fn apply(&self, op: &EntryOperation, transient: bool) -> Result<(), ApplyError>;

    /// Apply `op` unconditionally, replacing whatever is stored under its uid
    fn overwrite(&self, op: &EntryOperation) -> Result<(), ApplyError>;

    /// Register type metadata
    fn introduce_type(&self, descriptor: &TypeDescriptor) -> Result<(), ApplyError>;

    /// Add indexes to a known type
    fn add_type_index(&self, index: &TypeIndexData) -> Result<(), ApplyError>;

    /// Drop all replicated data of `group` ahead of a full resync
    fn clear_group(&self, group: &str) -> Result<(), ApplyError>;
}

/// Entry held by an [`InMemoryReplica`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Type name
    pub type_name: String,
    /// Current version
    pub version: u64,
    /// Entry body
    pub data: Vec<u8>,
    /// Fields set by change operations
    pub fields: BTreeMap<String, Vec<u8>>,
    /// Written as transient
    pub transient: bool,
}

#[derive(Default)]
struct ReplicaState {
    entries: HashMap<String, StoredEntry>,
    locks: HashMap<String, u64>,
    types: HashMap<String, TypeDescriptor>,
    indexes: HashMap<String, Vec<String>>,
}

/// Map-backed replica
///
/// With `require_types` set, operations on a type that was never introduced
/// fail with [`Conflict::MissingTypeMetadata`].
#[derive(Default)]
pub struct InMemoryReplica {
    state: RwLock<ReplicaState>,
    require_types: bool,
}

impl InMemoryReplica {
    /// Create an empty replica that accepts any type
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty replica that only accepts introduced types
    pub fn with_required_types() -> Self {
        Self {
            state: RwLock::new(ReplicaState::default()),
            require_types: true,
        }
    }

    /// Entry stored under `uid`
    pub fn get(&self, uid: &str) -> Option<StoredEntry> {
        self.state.read().entries.get(uid).cloned()
    }

    /// Whether `uid` is stored
    pub fn contains(&self, uid: &str) -> bool {
        self.state.read().entries.contains_key(uid)
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Sorted uids of every stored entry
    pub fn uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.state.read().entries.keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Lock `uid` on behalf of a local transaction
    pub fn lock_entry(&self, uid: &str, txn_id: u64) {
        self.state.write().locks.insert(uid.to_string(), txn_id);
    }

    /// Release the local lock on `uid`
    pub fn unlock_entry(&self, uid: &str) {
        self.state.write().locks.remove(uid);
    }

    /// Whether `type_name` was introduced
    pub fn has_type(&self, type_name: &str) -> bool {
        self.state.read().types.contains_key(type_name)
    }

    /// Indexes registered for `type_name`
    pub fn indexes(&self, type_name: &str) -> Vec<String> {
        self.state
            .read()
            .indexes
            .get(type_name)
            .cloned()
            .unwrap_or_default()
    }

    fn check_type(&self, state: &ReplicaState, type_name: &str) -> Result<(), Conflict> {
        if self.require_types && !state.types.contains_key(type_name) {
            return Err(Conflict::MissingTypeMetadata {
                type_name: type_name.to_string(),
            });
        }
        Ok(())
    }
}

fn check_unlocked(state: &ReplicaState, uid: &str) -> Result<(), Conflict> {
    match state.locks.get(uid) {
        Some(&txn_id) => Err(Conflict::LockedByTransaction {
            uid: uid.to_string(),
            txn_id,
        }),
        None => Ok(()),
    }
}

impl ReplicaApplier for InMemoryReplica {
    fn apply(&self, op: &EntryOperation, transient: bool) -> Result<(), ApplyError> {
        let mut state = self.state.write();
        self.check_type(&state, op.type_name())?;
        let uid = op.uid().to_string();

        match op {
            EntryOperation::Write(e) => {
                if state.entries.contains_key(&uid) {
                    return Err(Conflict::AlreadyInSpace { uid }.into());
                }
                state.entries.insert(
                    uid,
                    StoredEntry {
                        type_name: e.type_name.clone(),
                        version: e.version,
                        data: e.data.clone(),
                        fields: BTreeMap::new(),
                        transient,
                    },
                );
            }
            EntryOperation::Update(e) => {
                let local = state
                    .entries
                    .get(&uid)
                    .map(|s| s.version)
                    .ok_or_else(|| Conflict::NotInSpace { uid: uid.clone() })?;
                check_unlocked(&state, &uid)?;
                if local >= e.version {
                    return Err(Conflict::VersionConflict {
                        uid,
                        expected: e.version,
                        actual: local,
                    }
                    .into());
                }
                if let Some(stored) = state.entries.get_mut(&uid) {
                    stored.version = e.version;
                    stored.data = e.data.clone();
                    stored.transient = transient;
                }
            }
            EntryOperation::Take(e) => {
                let local = state
                    .entries
                    .get(&uid)
                    .map(|s| s.version)
                    .ok_or_else(|| Conflict::NotInSpace { uid: uid.clone() })?;
                check_unlocked(&state, &uid)?;
                if local > e.version {
                    return Err(Conflict::VersionConflict {
                        uid,
                        expected: e.version,
                        actual: local,
                    }
                    .into());
                }
                state.entries.remove(&uid);
            }
            EntryOperation::Change(c) => {
                let local = state
                    .entries
                    .get(&uid)
                    .map(|s| s.version)
                    .ok_or_else(|| Conflict::NotInSpace { uid: uid.clone() })?;
                if local == c.version {
                    // Replayed change already applied
                    return Ok(());
                }
                check_unlocked(&state, &uid)?;
                if local != c.previous_version {
                    return Err(Conflict::VersionConflict {
                        uid,
                        expected: c.previous_version,
                        actual: local,
                    }
                    .into());
                }
                if let Some(stored) = state.entries.get_mut(&uid) {
                    stored.version = c.version;
                    stored
                        .fields
                        .extend(c.changes.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        Ok(())
    }

    fn overwrite(&self, op: &EntryOperation) -> Result<(), ApplyError> {
        let mut state = self.state.write();
        let uid = op.uid().to_string();
        match op {
            EntryOperation::Write(e) | EntryOperation::Update(e) => {
                state.entries.insert(
                    uid,
                    StoredEntry {
                        type_name: e.type_name.clone(),
                        version: e.version,
                        data: e.data.clone(),
                        fields: BTreeMap::new(),
                        transient: false,
                    },
                );
            }
            EntryOperation::Take(_) => {
                state.entries.remove(&uid);
            }
            EntryOperation::Change(c) => {
                let stored = state.entries.get_mut(&uid).ok_or_else(|| {
                    ApplyError::Fatal(format!("cannot overwrite missing entry {} with a change", uid))
                })?;
                stored.version = c.version;
                stored
                    .fields
                    .extend(c.changes.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(())
    }

    fn introduce_type(&self, descriptor: &TypeDescriptor) -> Result<(), ApplyError> {
        let mut state = self.state.write();
        if let Some(parent) = &descriptor.super_type {
            self.check_type(&state, parent)?;
        }
        state
            .types
            .insert(descriptor.type_name.clone(), descriptor.clone());
        Ok(())
    }

    fn add_type_index(&self, index: &TypeIndexData) -> Result<(), ApplyError> {
        let mut state = self.state.write();
        if !state.types.contains_key(&index.type_name) {
            return Err(Conflict::MissingTypeMetadata {
                type_name: index.type_name.clone(),
            }
            .into());
        }
        let indexes = state.indexes.entry(index.type_name.clone()).or_default();
        for name in &index.index_names {
            if !indexes.contains(name) {
                indexes.push(name.clone());
            }
        }
        Ok(())
    }

    fn clear_group(&self, group: &str) -> Result<(), ApplyError> {
        let mut state = self.state.write();
        let cleared = state.entries.len();
        state.entries.clear();
        state.locks.clear();
        tracing::info!("Cleared {} entries of group {} for full resync", cleared, group);
        Ok(())
    }
}
