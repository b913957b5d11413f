//! Queue group selection
//!
//! Each group records when every member was last served. A publish goes to
//! the matching member that has waited longest, ties broken by insertion
//! sequence, so a stable membership rotates in subscription order. Members
//! leaving or joining never reset the rotation; a new member is served next.
//!
//! Groups are keyed by name alone. One group may span several patterns and
//! a publish selects among only the members that matched it, so the record
//! is per member rather than a single position in the group.

use ahash::AHashMap;
use bytes::Bytes;

use super::Subscription;

#[derive(Debug, Default)]
struct GroupState {
    /// Bumped on every selection
    tick: u64,
    /// Member sequence -> tick it was last served at
    served: AHashMap<u64, u64>,
}

#[derive(Debug, Default)]
pub struct QueueGroupSelector {
    groups: AHashMap<Bytes, GroupState>,
}

impl QueueGroupSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick exactly one of `members` and record it as served.
    ///
    /// `members` are the group's subscriptions that matched this publish, in
    /// any order.
    pub fn select<'a>(
        &mut self,
        group: &Bytes,
        members: &[&'a Subscription],
    ) -> Option<&'a Subscription> {
        if members.is_empty() {
            return None;
        }
        let state = self.groups.entry(group.clone()).or_default();

        let chosen = *members
            .iter()
            .min_by_key(|s| (state.served.get(&s.seq()).copied().unwrap_or(0), s.seq()))?;

        state.tick += 1;
        state.served.insert(chosen.seq(), state.tick);
        Some(chosen)
    }

    /// Drop the record of a member that left `group`
    pub fn forget_member(&mut self, group: &[u8], seq: u64) {
        if let Some(state) = self.groups.get_mut(group) {
            state.served.remove(&seq);
        }
    }

    /// Drop the state of a group that has no members left
    pub fn forget(&mut self, group: &[u8]) {
        self.groups.remove(group);
    }

    /// Number of groups with selection state
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
