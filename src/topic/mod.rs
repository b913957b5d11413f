//! Topic matching and subscription management
//!
//! Implements topic and pattern validation, an arena-backed topic trie, and
//! the subscription index that ties subscriptions to their connections.
//!
//! The index is owned by a single task and is never shared, so nothing in
//! here locks.

mod queue;
mod trie;
pub mod validation;

pub use queue::QueueGroupSelector;
pub use trie::TopicTrie;
pub use validation::{
    topic_matches_pattern, validate_topic, Privilege, Role, Token, TopicError, ValidTopic,
    WildcardKind, MAX_TOPIC_LAYERS, MAX_TOPIC_LENGTH,
};

use std::fmt;

use ahash::AHashMap;
use bytes::Bytes;

use crate::protocol::ProtocolError;

/// Broker-assigned connection identifier, unique for the broker's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Owning connection
    pub connection: ConnectionId,
    /// Client-chosen id, unique within the owning connection
    pub subscription_id: Bytes,
    /// Pattern as subscribed
    pub pattern: Bytes,
    pub queue_group: Option<Bytes>,
    /// Insertion order across the whole index
    seq: u64,
}

impl Subscription {
    pub fn new(
        connection: ConnectionId,
        subscription_id: Bytes,
        pattern: Bytes,
        queue_group: Option<Bytes>,
        seq: u64,
    ) -> Self {
        Self {
            connection,
            subscription_id,
            pattern,
            queue_group,
            seq,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Subscription index: the topic trie plus per-connection bookkeeping
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    trie: TopicTrie<Subscription>,
    /// Connection -> subscription id -> pattern, for UNSUB and teardown
    by_connection: AHashMap<ConnectionId, AHashMap<Bytes, ValidTopic>>,
    /// Queue group -> member count
    group_sizes: AHashMap<Bytes, usize>,
    next_seq: u64,
    len: usize,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription.
    ///
    /// Fields are copied out of the frame so the index never pins a
    /// connection's read buffer.
    pub fn subscribe(
        &mut self,
        connection: ConnectionId,
        subscription_id: &[u8],
        pattern: &ValidTopic,
        queue_group: Option<&[u8]>,
    ) -> Result<(), ProtocolError> {
        let owned = self.by_connection.entry(connection).or_default();
        if owned.contains_key(subscription_id) {
            return Err(ProtocolError::DuplicateSubscriptionId);
        }

        let subscription_id = Bytes::copy_from_slice(subscription_id);
        let pattern = pattern.detached();
        let queue_group = queue_group.map(Bytes::copy_from_slice);

        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(group) = &queue_group {
            *self.group_sizes.entry(group.clone()).or_insert(0) += 1;
        }

        let subscription = Subscription::new(
            connection,
            subscription_id.clone(),
            pattern.as_bytes().clone(),
            queue_group,
            seq,
        );
        self.trie.insert(&pattern, subscription);
        owned.insert(subscription_id, pattern);
        self.len += 1;
        Ok(())
    }

    /// Remove one subscription by id
    pub fn unsubscribe(
        &mut self,
        connection: ConnectionId,
        subscription_id: &[u8],
    ) -> Result<Subscription, ProtocolError> {
        let pattern = self
            .by_connection
            .get_mut(&connection)
            .and_then(|owned| owned.remove(subscription_id))
            .ok_or(ProtocolError::UnknownSubscriptionId)?;

        if self
            .by_connection
            .get(&connection)
            .is_some_and(|owned| owned.is_empty())
        {
            self.by_connection.remove(&connection);
        }

        self.detach(connection, subscription_id, &pattern)
            .ok_or(ProtocolError::Internal("subscription missing from trie"))
    }

    /// Remove every subscription owned by `connection` in one step
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<Subscription> {
        let Some(owned) = self.by_connection.remove(&connection) else {
            return Vec::new();
        };

        owned
            .into_iter()
            .filter_map(|(subscription_id, pattern)| {
                self.detach(connection, &subscription_id, &pattern)
            })
            .collect()
    }

    fn detach(
        &mut self,
        connection: ConnectionId,
        subscription_id: &[u8],
        pattern: &ValidTopic,
    ) -> Option<Subscription> {
        let removed = self.trie.remove(pattern, |s| {
            s.connection == connection && s.subscription_id == subscription_id
        })?;
        self.len -= 1;

        if let Some(group) = &removed.queue_group {
            if let Some(size) = self.group_sizes.get_mut(group) {
                *size -= 1;
                if *size == 0 {
                    self.group_sizes.remove(group);
                }
            }
        }
        Some(removed)
    }

    /// Call `callback` once for every subscription matching `topic`
    pub fn matches<'a, F>(&'a self, topic: &ValidTopic, callback: F)
    where
        F: FnMut(&'a Subscription),
    {
        self.trie.matches(topic, callback);
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of subscriptions owned by `connection`
    pub fn connection_len(&self, connection: ConnectionId) -> usize {
        self.by_connection.get(&connection).map_or(0, |owned| owned.len())
    }

    /// Number of subscriptions in queue group `group`
    pub fn group_size(&self, group: &[u8]) -> usize {
        self.group_sizes.get(group).copied().unwrap_or(0)
    }

    /// Live trie nodes, root included
    pub fn node_count(&self) -> usize {
        self.trie.node_count()
    }
}
