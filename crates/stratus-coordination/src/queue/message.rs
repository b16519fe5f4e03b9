//! Popped messages and pop options

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stratus_common::{Result, StratusError, deadline_after};
use stratus_store::{ReceiptHandle, ReceivedMessage};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long `pop` may block waiting for messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTime {
    /// Make one receive attempt and return
    Immediate,
    /// Block until at least one message arrives or the pop is cancelled
    Forever,
    /// Block for at most this long
    Up(Duration),
}

impl WaitTime {
    /// `-1` (any negative) waits forever, `0` returns immediately.
    ///
    /// Waits too long for a `Duration`, infinity included, also wait
    /// forever. NaN is rejected.
    pub fn from_secs(secs: f64) -> Result<Self> {
        if secs.is_nan() {
            return Err(StratusError::InvalidArgument(
                "wait time is not a number".to_string(),
            ));
        }
        Ok(if secs < 0.0 {
            WaitTime::Forever
        } else if secs == 0.0 {
            WaitTime::Immediate
        } else {
            Duration::try_from_secs_f64(secs).map_or(WaitTime::Forever, WaitTime::Up)
        })
    }
}

/// Options for [`RemoteQueue::pop_with`](super::RemoteQueue::pop_with)
#[derive(Debug, Clone)]
pub struct PopOptions {
    pub count: usize,
    pub wait: WaitTime,
    /// Visibility window of every popped message; defaults to `queue.visibility_timeout_secs`
    pub visibility: Option<Duration>,
    /// Keep polling until exactly `count` messages are collected or the wait ends
    pub ensure_count: bool,
    /// Extend visibility in the background until the message is deleted
    pub autorenew: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for PopOptions {
    fn default() -> Self {
        Self {
            count: 1,
            wait: WaitTime::Immediate,
            visibility: None,
            ensure_count: false,
            autorenew: false,
            cancel: None,
        }
    }
}

impl PopOptions {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    pub fn wait(mut self, wait: WaitTime) -> Self {
        self.wait = wait;
        self
    }

    pub fn visibility(mut self, visibility: Duration) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn ensure_count(mut self, ensure: bool) -> Self {
        self.ensure_count = ensure;
        self
    }

    pub fn autorenew(mut self, autorenew: bool) -> Self {
        self.autorenew = autorenew;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct MessageState {
    message_id: String,
    payload: Bytes,
    enqueue_time: DateTime<Utc>,
    received_at: DateTime<Utc>,
    delivery_count: u32,
    receipt: Mutex<ReceiptHandle>,
    visible_until: Mutex<Instant>,
    deleted: AtomicBool,
}

/// A message popped from a [`RemoteQueue`](super::RemoteQueue).
///
/// Clones share the receipt, so a renewal through one clone is seen by all.
#[derive(Clone)]
pub struct QueueMessage {
    state: Arc<MessageState>,
}

impl fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMessage")
            .field("message_id", &self.state.message_id)
            .field("len", &self.state.payload.len())
            .field("delivery_count", &self.state.delivery_count)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl QueueMessage {
    pub(crate) fn from_received(received: ReceivedMessage, visibility: Duration) -> Self {
        Self {
            state: Arc::new(MessageState {
                message_id: received.message_id,
                payload: received.payload,
                enqueue_time: received.enqueue_time,
                received_at: Utc::now(),
                delivery_count: received.delivery_count,
                receipt: Mutex::new(received.receipt),
                visible_until: Mutex::new(deadline_after(visibility)),
                deleted: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.message_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.state.payload
    }

    /// Payload as UTF-8 text
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.state.payload).map_err(|e| {
            StratusError::Internal(format!(
                "message '{}' is not valid UTF-8: {}",
                self.state.message_id, e
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.state.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.payload.is_empty()
    }

    pub fn enqueue_time(&self) -> DateTime<Utc> {
        self.state.enqueue_time
    }

    /// When this copy was popped
    pub fn received_at(&self) -> DateTime<Utc> {
        self.state.received_at
    }

    /// 1 on first delivery
    pub fn delivery_count(&self) -> u32 {
        self.state.delivery_count
    }

    pub fn visible_until(&self) -> Instant {
        *self.state.visible_until.lock()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn receipt(&self) -> ReceiptHandle {
        self.state.receipt.lock().clone()
    }

    pub(crate) fn apply_receipt(&self, receipt: ReceiptHandle, visibility: Duration) {
        *self.state.receipt.lock() = receipt;
        *self.state.visible_until.lock() = deadline_after(visibility);
    }

    /// Returns false if the message was already marked deleted.
    pub(crate) fn mark_deleted(&self) -> bool {
        !self.state.deleted.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_time_from_secs() {
        assert_eq!(WaitTime::from_secs(-1.0).unwrap(), WaitTime::Forever);
        assert_eq!(WaitTime::from_secs(0.0).unwrap(), WaitTime::Immediate);
        assert_eq!(
            WaitTime::from_secs(2.5).unwrap(),
            WaitTime::Up(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_wait_time_from_unbounded_secs() {
        assert_eq!(WaitTime::from_secs(f64::INFINITY).unwrap(), WaitTime::Forever);
        assert_eq!(WaitTime::from_secs(f64::NEG_INFINITY).unwrap(), WaitTime::Forever);
        assert_eq!(WaitTime::from_secs(1e300).unwrap(), WaitTime::Forever);
        assert!(matches!(
            WaitTime::from_secs(f64::NAN),
            Err(StratusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pop_options_builder() {
        let options = PopOptions::new(4)
            .wait(WaitTime::Forever)
            .visibility(Duration::from_secs(5))
            .ensure_count(true);
        assert_eq!(options.count, 4);
        assert_eq!(options.wait, WaitTime::Forever);
        assert_eq!(options.visibility, Some(Duration::from_secs(5)));
        assert!(options.ensure_count);
        assert!(!options.autorenew);
    }
}
