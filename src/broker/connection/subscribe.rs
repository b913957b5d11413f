//! SUB / UNSUB handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{ProtocolError, Subscribe, Unsubscribe};
use crate::topic::{validate_topic, Role};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let pattern = validate_topic(&subscribe.topic, Role::Subscribe, self.privilege)?;
        // An empty group name is the same as no group
        let queue_group = subscribe.queue_group.filter(|group| !group.is_empty());

        match self
            .hooks
            .on_subscribe_check(
                self.id,
                self.username.as_deref(),
                pattern.as_bytes(),
                queue_group.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(ProtocolError::PermissionDenied.into()),
            Err(e) => {
                debug!(connection = %self.id, "Subscribe check failed: {}", e);
                return Err(ProtocolError::PermissionDenied.into());
            }
        }

        trace!(
            connection = %self.id,
            pattern = %pattern.as_str_lossy(),
            queue_group = ?queue_group.as_deref().map(String::from_utf8_lossy),
            "SUB"
        );

        self.router
            .subscribe(self.id, subscribe.subscription_id, pattern, queue_group)
            .await?;
        self.ack().await
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        trace!(
            connection = %self.id,
            subscription_id = %String::from_utf8_lossy(&unsubscribe.subscription_id),
            "UNSUB"
        );
        self.router
            .unsubscribe(self.id, unsubscribe.subscription_id)
            .await?;
        self.ack().await
    }
}
