//! Message Router
//!
//! The router task is the single owner of the subscription index, the
//! queue-group rotation state and the outbound channel of every registered
//! connection. Connection tasks talk to it over an mpsc command channel, so
//! subscribe, unsubscribe and publish are serialized without any locking and
//! no publish ever observes a half-inserted subscription.

use ahash::AHashMap;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::dispatch::{Delivery, Dispatcher};
use super::BrokerEvent;
use crate::protocol::{Msg, ProtocolError, Publish};
use crate::topic::{ConnectionId, Subscription, ValidTopic};

const ROUTER_STOPPED: ProtocolError = ProtocolError::Internal("router stopped");

/// Commands accepted by the router task
#[derive(Debug)]
pub(crate) enum RouterCommand {
    Register {
        connection: ConnectionId,
        outbox: mpsc::Sender<Msg>,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        connection: ConnectionId,
        subscription_id: Bytes,
        pattern: ValidTopic,
        queue_group: Option<Bytes>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Unsubscribe {
        connection: ConnectionId,
        subscription_id: Bytes,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Publish {
        connection: ConnectionId,
        topic: ValidTopic,
        publish: Publish,
        /// Present when the publisher wants to know the delivery count
        reply: Option<oneshot::Sender<usize>>,
    },
    Disconnect {
        connection: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
}

/// Single-owner routing task
pub struct Router {
    dispatcher: Dispatcher,
    /// Connection -> outbound MSG channel
    outboxes: AHashMap<ConnectionId, mpsc::Sender<Msg>>,
    commands: mpsc::Receiver<RouterCommand>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Router {
    /// Create the router and the handle connection tasks use to reach it
    pub fn new(capacity: usize, events: broadcast::Sender<BrokerEvent>) -> (Self, RouterHandle) {
        let (tx, commands) = mpsc::channel(capacity.max(1));
        let router = Self {
            dispatcher: Dispatcher::new(),
            outboxes: AHashMap::new(),
            commands,
            events,
        };
        (router, RouterHandle { commands: tx })
    }

    /// Process commands until shutdown is signalled or every handle is dropped
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        debug!("Router started");
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                result = shutdown.recv() => match result {
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    _ => break,
                },
            }
        }
        info!(
            subscriptions = self.dispatcher.index().len(),
            connections = self.outboxes.len(),
            "Router stopped"
        );
    }

    pub(crate) fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Register {
                connection,
                outbox,
                reply,
            } => {
                self.outboxes.insert(connection, outbox);
                trace!(%connection, "registered outbox");
                let _ = reply.send(());
            }
            RouterCommand::Subscribe {
                connection,
                subscription_id,
                pattern,
                queue_group,
                reply,
            } => {
                let result = self.dispatcher.subscribe(
                    connection,
                    &subscription_id,
                    &pattern,
                    queue_group.as_deref(),
                );
                if result.is_ok() {
                    debug!(
                        %connection,
                        pattern = %pattern.as_str_lossy(),
                        "subscription added"
                    );
                    let _ = self.events.send(BrokerEvent::SubscriptionAdded {
                        connection,
                        subscription_id: String::from_utf8_lossy(&subscription_id).into_owned(),
                        pattern: pattern.as_str_lossy().into_owned(),
                    });
                }
                let _ = reply.send(result);
            }
            RouterCommand::Unsubscribe {
                connection,
                subscription_id,
                reply,
            } => {
                let result = self
                    .dispatcher
                    .unsubscribe(connection, &subscription_id)
                    .map(|removed| self.removed(&removed));
                let _ = reply.send(result);
            }
            RouterCommand::Publish {
                connection,
                topic,
                publish,
                reply,
            } => {
                let delivered = self.publish(connection, &topic, &publish);
                if let Some(reply) = reply {
                    let _ = reply.send(delivered);
                }
            }
            RouterCommand::Disconnect { connection, reply } => {
                self.outboxes.remove(&connection);
                let removed = self.dispatcher.remove_connection(connection);
                for subscription in &removed {
                    self.removed(subscription);
                }
                debug!(%connection, subscriptions = removed.len(), "connection removed");
                let _ = reply.send(removed.len());
            }
        }
    }

    fn removed(&self, subscription: &Subscription) {
        let _ = self.events.send(BrokerEvent::SubscriptionRemoved {
            connection: subscription.connection,
            subscription_id: String::from_utf8_lossy(&subscription.subscription_id).into_owned(),
            pattern: String::from_utf8_lossy(&subscription.pattern).into_owned(),
        });
    }

    /// Route one publish and hand each MSG to its recipient's outbox.
    ///
    /// A recipient that is backed up or gone loses the message; the
    /// publisher is never failed on its behalf.
    fn publish(&mut self, origin: ConnectionId, topic: &ValidTopic, publish: &Publish) -> usize {
        let deliveries = self.dispatcher.route(topic, publish);
        let matched = deliveries.len();
        let mut delivered = 0;

        for Delivery { connection, msg } in deliveries {
            let Some(outbox) = self.outboxes.get(&connection) else {
                debug!(%connection, "no outbox for subscriber, dropping MSG");
                continue;
            };
            match outbox.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(%connection, "outbound channel full, dropping MSG");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%connection, "outbound channel closed, dropping MSG");
                }
            }
        }

        trace!(
            %origin,
            topic = %topic.as_str_lossy(),
            matched,
            delivered,
            "routed publish"
        );
        delivered
    }
}

/// Cloneable handle to the router task
#[derive(Debug, Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    async fn send(&self, command: RouterCommand) -> Result<(), ProtocolError> {
        self.commands.send(command).await.map_err(|_| ROUTER_STOPPED)
    }

    /// Register the channel MSG frames for `connection` are delivered to
    pub async fn register(
        &self,
        connection: ConnectionId,
        outbox: mpsc::Sender<Msg>,
    ) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::Register {
            connection,
            outbox,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ROUTER_STOPPED)
    }

    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        subscription_id: Bytes,
        pattern: ValidTopic,
        queue_group: Option<Bytes>,
    ) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::Subscribe {
            connection,
            subscription_id,
            pattern,
            queue_group,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ROUTER_STOPPED)?
    }

    pub async fn unsubscribe(
        &self,
        connection: ConnectionId,
        subscription_id: Bytes,
    ) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::Unsubscribe {
            connection,
            subscription_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ROUTER_STOPPED)?
    }

    /// Queue a publish without waiting for it to be routed
    pub async fn publish(
        &self,
        connection: ConnectionId,
        topic: ValidTopic,
        publish: Publish,
    ) -> Result<(), ProtocolError> {
        self.send(RouterCommand::Publish {
            connection,
            topic,
            publish,
            reply: None,
        })
        .await
    }

    /// Publish and wait until routing finished; returns the number of MSG
    /// frames handed to recipients
    pub async fn publish_acked(
        &self,
        connection: ConnectionId,
        topic: ValidTopic,
        publish: Publish,
    ) -> Result<usize, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::Publish {
            connection,
            topic,
            publish,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ROUTER_STOPPED)
    }

    /// Drop the outbox and every subscription of `connection`; returns the
    /// number of subscriptions removed
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<usize, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::Disconnect { connection, reply })
            .await?;
        rx.await.map_err(|_| ROUTER_STOPPED)
    }
}
