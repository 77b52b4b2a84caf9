//! Target group and its source attachment slot

use super::channel::TargetChannel;
use crate::applier::ReplicaApplier;
use crate::config::{AttachPolicy, GroupMembership};
use crate::conflict::ConflictPolicy;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared handle to a target channel
pub type SharedChannel = Arc<Mutex<TargetChannel>>;

struct Attachment {
    channel: SharedChannel,
    attached: bool,
}

/// Receiving end of one replication group
///
/// Under [`AttachPolicy::SingleActiveSource`] at most one source may be
/// attached at a time. The slot is a single mutex-guarded map, so attach and
/// detach decisions never race each other.
pub struct TargetGroup {
    membership: GroupMembership,
    attach_policy: AttachPolicy,
    policy: ConflictPolicy,
    applier: Arc<dyn ReplicaApplier>,
    slot: Mutex<HashMap<String, Attachment>>,
}

impl TargetGroup {
    /// Create a target group applying into `applier`
    pub fn new(
        membership: GroupMembership,
        attach_policy: AttachPolicy,
        policy: ConflictPolicy,
        applier: Arc<dyn ReplicaApplier>,
    ) -> Self {
        Self {
            membership,
            attach_policy,
            policy,
            applier,
            slot: Mutex::new(HashMap::new()),
        }
    }

    /// Group name
    pub fn name(&self) -> String {
        self.membership.name()
    }

    /// Attach `source`, returning its channel
    ///
    /// - a different source while the current one is attached fails with
    ///   [`Error::SourceAlreadyAttached`] and leaves the current one untouched
    /// - a detached previous source is closed and replaced
    /// - the same source gets its existing channel back (resume)
    pub fn attach(&self, source: &str) -> Result<SharedChannel> {
        let group = self.name();
        if !self.membership.allows_source(source) {
            return Err(Error::UnknownMember(format!(
                "source {} is not a member of group {}",
                source, group
            )));
        }

        let mut slot = self.slot.lock();
        if self.attach_policy == AttachPolicy::SingleActiveSource {
            if let Some((active, _)) = slot
                .iter()
                .find(|(name, a)| a.attached && name.as_str() != source)
            {
                tracing::warn!(
                    "Group {}: rejecting source {}, {} is attached",
                    group,
                    source,
                    active
                );
                return Err(Error::SourceAlreadyAttached {
                    group,
                    active: active.clone(),
                    attempted: source.to_string(),
                });
            }

            let stale: Vec<String> = slot
                .keys()
                .filter(|name| name.as_str() != source)
                .cloned()
                .collect();
            for name in stale {
                if let Some(previous) = slot.remove(&name) {
                    previous.channel.lock().disconnect();
                    tracing::info!(
                        "Group {}: closed stale channel from {} for {}",
                        group,
                        name,
                        source
                    );
                }
            }
        }

        let attachment = slot.entry(source.to_string()).or_insert_with(|| {
            tracing::info!("Group {}: new channel from {}", group, source);
            Attachment {
                channel: Arc::new(Mutex::new(TargetChannel::new(
                    group.clone(),
                    source,
                    self.applier.clone(),
                    self.policy.clone(),
                ))),
                attached: false,
            }
        });
        attachment.attached = true;
        Ok(attachment.channel.clone())
    }

    /// Mark `source` detached; its channel is kept for a later resume
    pub fn detach(&self, source: &str) {
        let mut slot = self.slot.lock();
        if let Some(attachment) = slot.get_mut(source) {
            attachment.attached = false;
            attachment.channel.lock().disconnect();
            tracing::info!("Group {}: source {} detached", self.name(), source);
        }
    }

    /// Drop `source` and its channel
    pub fn remove(&self, source: &str) -> bool {
        self.slot.lock().remove(source).is_some()
    }

    /// Currently attached sources, sorted
    pub fn attached_sources(&self) -> Vec<String> {
        let slot = self.slot.lock();
        let mut sources: Vec<String> = slot
            .iter()
            .filter(|(_, a)| a.attached)
            .map(|(name, _)| name.clone())
            .collect();
        sources.sort();
        sources
    }

    /// Channel of `source`, attached or not
    pub fn channel(&self, source: &str) -> Option<SharedChannel> {
        self.slot.lock().get(source).map(|a| a.channel.clone())
    }

    /// Applier the group writes into
    pub fn applier(&self) -> &Arc<dyn ReplicaApplier> {
        &self.applier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::InMemoryReplica;
    use crate::config::GroupConfig;

    fn group(policy: AttachPolicy) -> TargetGroup {
        TargetGroup::new(
            GroupMembership::new(GroupConfig::new("orders")),
            policy,
            ConflictPolicy::default(),
            Arc::new(InMemoryReplica::new()),
        )
    }

    #[test]
    fn test_single_active_source() {
        let group = group(AttachPolicy::SingleActiveSource);
        let first = group.attach("primary").unwrap();

        let err = group.attach("backup").err().unwrap();
        assert!(matches!(
            err,
            Error::SourceAlreadyAttached { ref active, ref attempted, .. }
                if active == "primary" && attempted == "backup"
        ));
        assert_eq!(group.attached_sources(), vec!["primary".to_string()]);

        let again = group.attach("primary").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_detached_source_is_replaced() {
        let group = group(AttachPolicy::SingleActiveSource);
        group.attach("primary").unwrap();
        group.detach("primary");

        group.attach("backup").unwrap();
        assert_eq!(group.attached_sources(), vec!["backup".to_string()]);
        assert!(group.channel("primary").is_none());
    }

    #[test]
    fn test_multi_source() {
        let group = group(AttachPolicy::MultiSource);
        group.attach("site-a").unwrap();
        group.attach("site-b").unwrap();
        assert_eq!(group.attached_sources().len(), 2);
    }

    #[test]
    fn test_membership_enforced() {
        let group = TargetGroup::new(
            GroupMembership::new(GroupConfig::new("orders").with_sources(["primary"])),
            AttachPolicy::SingleActiveSource,
            ConflictPolicy::default(),
            Arc::new(InMemoryReplica::new()),
        );
        assert!(matches!(group.attach("rogue"), Err(Error::UnknownMember(_))));
    }
}
