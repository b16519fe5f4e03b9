//! Scoped processing of a popped message

use stratus_common::Result;
use tracing::warn;

use super::message::QueueMessage;
use super::remote::RemoteQueue;

/// What happens to a message whose processing failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnError {
    /// Delete it anyway
    #[default]
    Delete,
    /// Leave it in the queue so it is delivered again
    Redeliver,
}

/// Owns a popped message until it is settled.
///
/// `complete` deletes the message and `abandon` makes it visible again.
/// A guard dropped without either is settled per its policy: `Delete`
/// spawns a best-effort delete, `Redeliver` stops any auto-renewal so the
/// message reappears when its visibility lapses.
#[must_use = "a dropped guard settles the message per its policy"]
pub struct MessageGuard {
    queue: RemoteQueue,
    message: QueueMessage,
    policy: OnError,
    settled: bool,
}

impl MessageGuard {
    pub(crate) fn new(queue: RemoteQueue, message: QueueMessage, policy: OnError) -> Self {
        Self {
            queue,
            message,
            policy,
            settled: false,
        }
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    pub fn policy(&self) -> OnError {
        self.policy
    }

    /// Processing succeeded: delete the message.
    pub async fn complete(mut self) -> Result<()> {
        self.settled = true;
        self.queue.delete(&self.message).await
    }

    /// Put the message back for another consumer right away.
    pub async fn abandon(mut self) -> Result<()> {
        self.settled = true;
        self.queue.release(&self.message).await
    }

    /// Processing failed: settle per the guard's policy.
    pub async fn fail(self) -> Result<()> {
        match self.policy {
            OnError::Delete => self.complete().await,
            OnError::Redeliver => self.abandon().await,
        }
    }
}

impl Drop for MessageGuard {
    fn drop(&mut self) {
        if self.settled || self.message.is_deleted() {
            return;
        }

        match self.policy {
            OnError::Delete => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(
                        message_id = self.message.id(),
                        "No runtime to delete dropped message, it will be redelivered"
                    );
                    return;
                };
                let queue = self.queue.clone();
                let message = self.message.clone();
                runtime.spawn(async move {
                    if let Err(e) = queue.delete(&message).await {
                        warn!(message_id = message.id(), error = %e, "Failed to delete dropped message");
                    }
                });
            }
            OnError::Redeliver => self.queue.stop_renewing(&self.message),
        }
    }
}
