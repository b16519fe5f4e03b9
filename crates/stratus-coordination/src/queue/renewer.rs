//! Background visibility renewal for auto-renewed messages

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use stratus_common::StratusError;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::message::QueueMessage;
use super::remote::update_visibility;
use crate::store_client::StoreClient;

/// Extends the visibility of tracked messages every `interval` until they
/// are deleted, fail to renew, or the owning queue handle is dropped.
pub(crate) struct AutoRenewer {
    queue: String,
    tracked: Arc<DashMap<String, QueueMessage>>,
    store: StoreClient,
    interval: Duration,
    visibility: Duration,
    task: Mutex<Option<DropGuard>>,
}

impl AutoRenewer {
    pub fn new(queue: &str, store: StoreClient, interval: Duration, visibility: Duration) -> Self {
        Self {
            queue: queue.to_string(),
            tracked: Arc::new(DashMap::new()),
            store,
            interval,
            visibility,
            task: Mutex::new(None),
        }
    }

    pub fn track(&self, message: &QueueMessage) {
        self.tracked
            .insert(message.id().to_string(), message.clone());
        self.ensure_started();
        debug!(queue = %self.queue, message_id = message.id(), "Tracking message for renewal");
    }

    pub fn untrack(&self, message_id: &str) {
        if self.tracked.remove(message_id).is_some() {
            debug!(queue = %self.queue, message_id, "Stopped renewing message");
        }
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    /// Spawned lazily so queue handles can be built outside a runtime.
    fn ensure_started(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        tokio::spawn(run(
            self.queue.clone(),
            self.tracked.clone(),
            self.store.clone(),
            self.interval,
            self.visibility,
            stop.clone(),
        ));
        *task = Some(stop.drop_guard());
    }
}

async fn run(
    queue: String,
    tracked: Arc<DashMap<String, QueueMessage>>,
    store: StoreClient,
    interval: Duration,
    visibility: Duration,
    stop: CancellationToken,
) {
    debug!(queue = %queue, "Renewal background task started");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let messages: Vec<QueueMessage> =
                    tracked.iter().map(|entry| entry.value().clone()).collect();

                for message in messages {
                    if message.is_deleted() {
                        tracked.remove(message.id());
                        continue;
                    }
                    match update_visibility(&store, &message, visibility).await {
                        Ok(()) => {
                            debug!(queue = %queue, message_id = message.id(), "Renewed message");
                        }
                        Err(e @ (StratusError::LeaseExpired { .. } | StratusError::MessageNotFound(_))) => {
                            warn!(queue = %queue, message_id = message.id(), error = %e, "Message lost, no longer renewing");
                            tracked.remove(message.id());
                        }
                        Err(e) => {
                            warn!(queue = %queue, message_id = message.id(), error = %e, "Message renewal failed");
                        }
                    }
                }
            }
        }
    }

    debug!(queue = %queue, untracked = tracked.len(), "Renewal background task finished");
    tracked.clear();
}
