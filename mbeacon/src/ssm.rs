//! Reference-counted source-specific multicast membership.
//!
//! Several beacons can share one host, so interest in a (group, source) pair
//! is tracked per referencing endpoint: the OS-level join happens on the
//! first reference and the leave on the last, with empty maps pruned on the
//! way out.

use crate::addr::Address;
use crate::transport::Transport;
use smallvec::SmallVec;
use std::collections::BTreeMap;

type MemberSet = SmallVec<[Address; 4]>;

/// Membership map: group -> port-stripped source -> referencing endpoints
/// (ports intact). An OS join for (group, source) exists iff the innermost
/// set is non-empty.
#[derive(Debug, Default)]
pub struct SsmGroupManager {
    groups: BTreeMap<Address, BTreeMap<Address, MemberSet>>,
}

impl SsmGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` as a member of `group`, issuing at most one
    /// OS-level join per distinct (group, stripped source). Re-registering
    /// an endpoint already present is a no-op.
    pub fn join<T: Transport>(&mut self, transport: &mut T, group: &Address, source: &Address) {
        let key = source.strip_port();
        let sources = self.groups.entry(*group).or_default();
        match sources.get_mut(&key) {
            Some(members) => {
                if !members.contains(source) {
                    members.push(*source);
                }
            }
            None => {
                if let Err(e) = transport.join_source_group(group, &key) {
                    log::warn!("SSM join of {} on {} failed: {}", key, group, e);
                } else {
                    log::debug!("SSM join of {} on {}", key, group);
                }
                let mut members = MemberSet::new();
                members.push(*source);
                sources.insert(key, members);
            }
        }
    }

    /// Drops `source`'s reference; the OS-level leave happens only when the
    /// last referencing endpoint is gone.
    pub fn leave<T: Transport>(&mut self, transport: &mut T, group: &Address, source: &Address) {
        let key = source.strip_port();
        let Some(sources) = self.groups.get_mut(group) else {
            return;
        };
        let Some(members) = sources.get_mut(&key) else {
            return;
        };
        members.retain(|a| a != source);
        if members.is_empty() {
            sources.remove(&key);
            if let Err(e) = transport.leave_source_group(group, &key) {
                log::warn!("SSM leave of {} on {} failed: {}", key, group, e);
            } else {
                log::debug!("SSM leave of {} on {}", key, group);
            }
        }
        if sources.is_empty() {
            self.groups.remove(group);
        }
    }

    /// Convenience for callers holding an optional configured group.
    pub fn join_if_active<T: Transport>(
        &mut self,
        transport: &mut T,
        group: Option<&Address>,
        source: &Address,
    ) {
        if let Some(group) = group {
            self.join(transport, group, source);
        }
    }

    pub fn leave_if_active<T: Transport>(
        &mut self,
        transport: &mut T,
        group: Option<&Address>,
        source: &Address,
    ) {
        if let Some(group) = group {
            self.leave(transport, group, source);
        }
    }

    /// True while an OS-level join for (group, source) is outstanding.
    pub fn is_joined(&self, group: &Address, source: &Address) -> bool {
        self.groups
            .get(group)
            .and_then(|sources| sources.get(&source.strip_port()))
            .is_some_and(|members| !members.is_empty())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
