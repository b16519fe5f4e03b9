//! Lease-based message queue over store queue primitives

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use stratus_common::{
    Backoff, QueueConfig, Result, StratusError, deadline_after, metric_names, sleep_or_cancel,
};
use stratus_store::StoreError;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::guard::{MessageGuard, OnError};
use super::message::{PopOptions, QueueMessage, WaitTime};
use super::renewer::AutoRenewer;
use crate::store_client::StoreClient;

struct QueueInner {
    name: String,
    store: StoreClient,
    config: QueueConfig,
    renewer: AutoRenewer,
}

/// Handle to a named remote queue.
///
/// Delivery is at-least-once: a popped message stays hidden for its
/// visibility window and reappears, with a higher delivery count, unless it
/// is deleted first. Ordering is best-effort FIFO.
#[derive(Clone)]
pub struct RemoteQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RemoteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueue")
            .field("name", &self.inner.name)
            .field("autorenewed", &self.inner.renewer.len())
            .finish()
    }
}

fn message_error(e: StoreError, message_id: &str) -> StratusError {
    match e {
        StoreError::NotFound(_) => StratusError::MessageNotFound(message_id.to_string()),
        other => other.into(),
    }
}

/// Hide `message` for `visibility` from now, refreshing its receipt.
pub(crate) async fn update_visibility(
    store: &StoreClient,
    message: &QueueMessage,
    visibility: Duration,
) -> Result<()> {
    if message.is_deleted() {
        return Err(StratusError::MessageNotFound(message.id().to_string()));
    }
    let receipt = message.receipt();
    let renewed = store
        .queue_update_visibility(&receipt, visibility)
        .await
        .map_err(|e| message_error(e, message.id()))?;
    message.apply_receipt(renewed, visibility);
    Ok(())
}

impl RemoteQueue {
    pub fn new(name: impl Into<String>, store: StoreClient, config: QueueConfig) -> Self {
        let name = name.into();
        let renewer = AutoRenewer::new(
            &name,
            store.clone(),
            config.autorenew_interval(),
            config.visibility_timeout(),
        );
        Self {
            inner: Arc::new(QueueInner {
                name,
                store,
                config,
                renewer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create the queue; succeeds if it already exists.
    pub async fn create(&self) -> Result<()> {
        self.inner.store.queue_create(&self.inner.name).await?;
        debug!(queue = %self.inner.name, "Queue created");
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        self.inner.store.queue_destroy(&self.inner.name).await?;
        debug!(queue = %self.inner.name, "Queue destroyed");
        Ok(())
    }

    /// Approximate number of undeleted messages, hidden ones included
    pub async fn len(&self) -> Result<usize> {
        Ok(self.inner.store.queue_len(&self.inner.name).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn push(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.push_many([payload]).await
    }

    /// Enqueue several messages, each with its own id.
    pub async fn push_many<I, P>(&self, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let payloads: Vec<Bytes> = payloads.into_iter().map(Into::into).collect();
        if payloads.is_empty() {
            return Ok(());
        }
        let count = payloads.len();
        self.inner
            .store
            .queue_send(&self.inner.name, payloads)
            .await?;
        debug!(queue = %self.inner.name, count, "Messages pushed");
        Ok(())
    }

    /// Pop up to `count` messages, hiding them for `visibility_secs`.
    pub async fn pop(
        &self,
        count: usize,
        wait: WaitTime,
        visibility_secs: u64,
    ) -> Result<Vec<QueueMessage>> {
        self.pop_with(
            PopOptions::new(count)
                .wait(wait)
                .visibility(Duration::from_secs(visibility_secs)),
        )
        .await
    }

    /// Pop a single message with the default visibility.
    pub async fn pop_one(&self, wait: WaitTime) -> Result<Option<QueueMessage>> {
        let mut messages = self.pop_with(PopOptions::new(1).wait(wait)).await?;
        Ok(messages.pop())
    }

    /// Pop messages, polling with growing intervals while waiting.
    ///
    /// Without `ensure_count` the wait ends at the first non-empty receive;
    /// with it, once `count` messages are collected. A cancelled pop hands
    /// back any messages it collected so they are redelivered at once.
    pub async fn pop_with(&self, options: PopOptions) -> Result<Vec<QueueMessage>> {
        if options.count == 0 {
            return Ok(Vec::new());
        }
        let visibility = options
            .visibility
            .unwrap_or_else(|| self.inner.config.visibility_timeout());
        let cancel = options.cancel.clone().unwrap_or_default();
        let deadline = match options.wait {
            WaitTime::Up(wait) => Some(deadline_after(wait)),
            WaitTime::Immediate | WaitTime::Forever => None,
        };
        let mut backoff = Backoff::new(&self.inner.config.poll_backoff());
        let mut collected: Vec<QueueMessage> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return self.cancel_pop(collected).await;
            }

            let wanted = options.count - collected.len();
            let received = self
                .inner
                .store
                .queue_receive(&self.inner.name, wanted, visibility)
                .await?;
            collected.extend(
                received
                    .into_iter()
                    .map(|message| QueueMessage::from_received(message, visibility)),
            );

            let satisfied = if options.ensure_count {
                collected.len() >= options.count
            } else {
                !collected.is_empty()
            };
            if satisfied || options.wait == WaitTime::Immediate {
                break;
            }

            let mut delay = backoff.next_delay();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                delay = delay.min(deadline - now);
            }
            if sleep_or_cancel(delay, &cancel).await.is_err() {
                return self.cancel_pop(collected).await;
            }
        }

        if !collected.is_empty() {
            metrics::counter!(metric_names::QUEUE_POPPED, "queue" => self.inner.name.clone())
                .increment(collected.len() as u64);
            debug!(queue = %self.inner.name, count = collected.len(), "Messages popped");
        }
        if options.autorenew {
            for message in &collected {
                self.inner.renewer.track(message);
            }
        }
        Ok(collected)
    }

    async fn cancel_pop(&self, collected: Vec<QueueMessage>) -> Result<Vec<QueueMessage>> {
        for message in &collected {
            if let Err(e) = self.release(message).await {
                warn!(queue = %self.inner.name, message_id = message.id(), error = %e, "Failed to hand back message of cancelled pop");
            }
        }
        Err(StratusError::Cancelled)
    }

    /// Keep `message` hidden for `visibility` from now.
    ///
    /// Fails with `LeaseExpired` once its visibility lapsed or it was
    /// popped again, and with `MessageNotFound` once deleted.
    pub async fn update(&self, message: &QueueMessage, visibility: Duration) -> Result<()> {
        update_visibility(&self.inner.store, message, visibility).await
    }

    /// Delete `message` permanently; deleting twice is a no-op.
    pub async fn delete(&self, message: &QueueMessage) -> Result<()> {
        if message.is_deleted() {
            return Ok(());
        }
        self.inner.renewer.untrack(message.id());

        let receipt = message.receipt();
        match self.inner.store.queue_delete(&receipt).await {
            Ok(()) => {}
            // Renewed in the background between reading and using the receipt
            Err(StoreError::LeaseExpired(_)) if message.receipt() != receipt => {
                self.inner
                    .store
                    .queue_delete(&message.receipt())
                    .await
                    .map_err(|e| message_error(e, message.id()))?;
            }
            Err(e) => return Err(message_error(e, message.id())),
        }

        if message.mark_deleted() {
            metrics::counter!(metric_names::QUEUE_DELETED, "queue" => self.inner.name.clone())
                .increment(1);
            debug!(queue = %self.inner.name, message_id = message.id(), "Message deleted");
        }
        Ok(())
    }

    /// Make `message` visible again right away.
    pub async fn release(&self, message: &QueueMessage) -> Result<()> {
        if message.is_deleted() {
            return Ok(());
        }
        self.inner.renewer.untrack(message.id());
        match update_visibility(&self.inner.store, message, Duration::ZERO).await {
            Ok(()) => Ok(()),
            Err(StratusError::LeaseExpired { .. } | StratusError::MessageNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Start renewing `message` in the background until it is deleted.
    pub fn keep_alive(&self, message: &QueueMessage) {
        self.inner.renewer.track(message);
    }

    pub(crate) fn stop_renewing(&self, message: &QueueMessage) {
        self.inner.renewer.untrack(message.id());
    }

    /// Number of messages currently renewed in the background
    pub fn autorenewed(&self) -> usize {
        self.inner.renewer.len()
    }

    pub fn guard(&self, message: QueueMessage, policy: OnError) -> MessageGuard {
        MessageGuard::new(self.clone(), message, policy)
    }

    /// Run `f` on `message`, deleting it on success and settling it per
    /// `policy` on failure.
    pub async fn consume<T, E, F, Fut>(
        &self,
        message: QueueMessage,
        policy: OnError,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(QueueMessage) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<StratusError>,
    {
        let guard = self.guard(message, policy);
        match f(guard.message().clone()).await {
            Ok(value) => {
                guard.complete().await?;
                Ok(value)
            }
            Err(e) => {
                let message_id = guard.message().id().to_string();
                if let Err(settle) = guard.fail().await {
                    warn!(queue = %self.inner.name, message_id = %message_id, error = %settle, "Failed to settle message after error");
                }
                Err(e)
            }
        }
    }
}
