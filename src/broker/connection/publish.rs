//! PUB handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{ProtocolError, Publish};
use crate::topic::{validate_topic, Role};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        let topic = validate_topic(&publish.topic, Role::Publish, self.privilege)?;
        // A reply-to must be something a responder could publish to
        if let Some(reply_to) = &publish.reply_to {
            validate_topic(reply_to, Role::Publish, self.privilege)?;
        }

        match self
            .hooks
            .on_publish_check(self.id, self.username.as_deref(), topic.as_bytes())
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(ProtocolError::PermissionDenied.into()),
            Err(e) => {
                debug!(connection = %self.id, "Publish check failed: {}", e);
                return Err(ProtocolError::PermissionDenied.into());
            }
        }

        trace!(
            connection = %self.id,
            topic = %topic.as_str_lossy(),
            payload_len = publish.payload.len(),
            "PUB"
        );

        if self.verbose {
            // OK is only sent once every recipient's MSG has been queued
            self.router.publish_acked(self.id, topic, publish).await?;
            self.ack().await
        } else {
            self.router.publish(self.id, topic, publish).await?;
            Ok(())
        }
    }
}
