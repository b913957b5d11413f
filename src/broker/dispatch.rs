//! Dispatch engine
//!
//! Pure, synchronous routing: given a validated topic, find every matching
//! subscription, collapse queue groups to one member each, and build the MSG
//! frames. The payload and header are shared with the PUB they came from.

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::trace;

use crate::protocol::{Msg, ProtocolError, Publish};
use crate::topic::{
    ConnectionId, QueueGroupSelector, Subscription, SubscriptionIndex, ValidTopic,
};

/// One MSG bound for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub connection: ConnectionId,
    pub msg: Msg,
}

pub type Deliveries = SmallVec<[Delivery; 8]>;

#[derive(Debug, Default)]
pub struct Dispatcher {
    index: SubscriptionIndex,
    queues: QueueGroupSelector,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        connection: ConnectionId,
        subscription_id: &[u8],
        pattern: &ValidTopic,
        queue_group: Option<&[u8]>,
    ) -> Result<(), ProtocolError> {
        self.index
            .subscribe(connection, subscription_id, pattern, queue_group)
    }

    pub fn unsubscribe(
        &mut self,
        connection: ConnectionId,
        subscription_id: &[u8],
    ) -> Result<Subscription, ProtocolError> {
        let removed = self.index.unsubscribe(connection, subscription_id)?;
        self.forget_empty_group(&removed);
        Ok(removed)
    }

    /// Drop every subscription of a closing connection
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<Subscription> {
        let removed = self.index.remove_connection(connection);
        for subscription in &removed {
            self.forget_empty_group(subscription);
        }
        removed
    }

    fn forget_empty_group(&mut self, subscription: &Subscription) {
        if let Some(group) = &subscription.queue_group {
            if self.index.group_size(group) == 0 {
                self.queues.forget(group);
            } else {
                self.queues.forget_member(group, subscription.seq());
            }
        }
    }

    /// Build the MSG frames for one publish.
    ///
    /// Ordinary subscriptions each get a copy; every queue group that
    /// matched gets exactly one, the member that has waited longest.
    pub fn route(&mut self, topic: &ValidTopic, publish: &Publish) -> Deliveries {
        let Self { index, queues } = self;

        let mut direct: SmallVec<[&Subscription; 8]> = SmallVec::new();
        let mut groups: SmallVec<[(&Bytes, SmallVec<[&Subscription; 4]>); 2]> = SmallVec::new();

        index.matches(topic, |subscription| match &subscription.queue_group {
            None => direct.push(subscription),
            Some(group) => match groups.iter_mut().find(|(name, _)| *name == group) {
                Some((_, members)) => members.push(subscription),
                None => groups.push((group, smallvec::smallvec![subscription])),
            },
        });

        for (group, members) in groups.iter() {
            if let Some(chosen) = queues.select(group, members.as_slice()) {
                trace!(
                    group = %String::from_utf8_lossy(group),
                    connection = %chosen.connection,
                    "queue group member selected"
                );
                direct.push(chosen);
            }
        }

        direct
            .into_iter()
            .map(|subscription| Delivery {
                connection: subscription.connection,
                msg: Msg {
                    topic: publish.topic.clone(),
                    subscription_id: subscription.subscription_id.clone(),
                    reply_to: publish.reply_to.clone(),
                    header: publish.header.clone(),
                    payload: publish.payload.clone(),
                },
            })
            .collect()
    }

    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }
}
