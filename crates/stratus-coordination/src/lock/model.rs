//! Lock handle and request types

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stratus_common::saturating_add;
use stratus_store::LeaseToken;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Who a lock is held on behalf of, within this process.
///
/// Across processes every context contends equally; the context only
/// decides which in-process callers are treated as the same holder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockContext {
    /// The lock manager instance that acquired it; reentrant without a round trip
    #[default]
    Instance,
    /// Any caller in this application; re-acquisition renews through the store
    Application,
    /// Any caller presenting the same label in this application
    Custom(String),
}

impl fmt::Display for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockContext::Instance => f.write_str("instance"),
            LockContext::Application => f.write_str("app"),
            LockContext::Custom(label) => write!(f, "custom:{}", label),
        }
    }
}

/// Per-call overrides for `acquire`
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Lease duration; falls back to `lock.lease_duration_ms`
    pub lease: Option<Duration>,
    /// How long to wait for a contended lock; falls back to `lock.acquire_timeout_ms`
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub(crate) struct HandleState {
    resource_id: String,
    context: LockContext,
    holder: String,
    token: LeaseToken,
    acquired_at: Instant,
    expires_at: Mutex<Instant>,
    released: AtomicBool,
    renewal: Mutex<Option<CancellationToken>>,
}

/// A held lock.
///
/// Clones share state: releasing through one clone releases them all.
/// Dropping a handle does not release the lease; it lapses at `expires_at`.
#[derive(Clone)]
pub struct LockHandle {
    state: Arc<HandleState>,
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource_id", &self.state.resource_id)
            .field("context", &self.state.context)
            .field("lease_id", &self.state.token.lease_id)
            .field("released", &self.is_released())
            .field("remaining", &self.remaining())
            .field("auto_renewing", &self.has_renewal())
            .finish()
    }
}

impl LockHandle {
    pub(crate) fn new(
        resource_id: &str,
        context: LockContext,
        holder: String,
        token: LeaseToken,
        lease: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(HandleState {
                resource_id: resource_id.to_string(),
                context,
                holder,
                token,
                acquired_at: now,
                expires_at: Mutex::new(saturating_add(now, lease)),
                released: AtomicBool::new(false),
                renewal: Mutex::new(None),
            }),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.state.resource_id
    }

    pub fn context(&self) -> &LockContext {
        &self.state.context
    }

    /// Holder identity the lease was taken for
    pub fn holder(&self) -> &str {
        &self.state.holder
    }

    pub fn token(&self) -> &LeaseToken {
        &self.state.token
    }

    pub fn acquired_at(&self) -> Instant {
        self.state.acquired_at
    }

    pub fn expires_at(&self) -> Instant {
        *self.state.expires_at.lock()
    }

    /// Time left before the lock lapses; zero once released or expired
    pub fn remaining(&self) -> Duration {
        if self.is_released() {
            return Duration::ZERO;
        }
        self.expires_at().saturating_duration_since(Instant::now())
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }

    /// Neither released nor expired
    pub fn is_valid(&self) -> bool {
        !self.is_released() && !self.is_expired()
    }

    /// Whether both handles refer to the same store lease
    pub fn same_lease(&self, other: &LockHandle) -> bool {
        self.state.token == other.state.token
    }

    pub(crate) fn set_expires_at(&self, at: Instant) {
        *self.state.expires_at.lock() = at;
    }

    /// Marks the handle released; returns false if it already was.
    pub(crate) fn mark_released(&self) -> bool {
        let first = !self.state.released.swap(true, Ordering::SeqCst);
        if first {
            self.stop_renewal();
        }
        first
    }

    pub(crate) fn has_renewal(&self) -> bool {
        self.state.renewal.lock().is_some()
    }

    pub(crate) fn attach_renewal(&self, stop: CancellationToken) {
        if let Some(previous) = self.state.renewal.lock().replace(stop) {
            previous.cancel();
        }
    }

    pub(crate) fn stop_renewal(&self) {
        if let Some(stop) = self.state.renewal.lock().take() {
            stop.cancel();
        }
    }
}

/// Snapshot of lock manager counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub reentrant_acquisitions: u64,
    pub releases: u64,
    pub renewals: u64,
    pub contentions: u64,
    pub timeouts: u64,
    /// Locks this application currently believes it holds
    pub held: u64,
}

#[derive(Default)]
pub(crate) struct LockStatsCollector {
    pub acquisitions: AtomicU64,
    pub reentrant_acquisitions: AtomicU64,
    pub releases: AtomicU64,
    pub renewals: AtomicU64,
    pub contentions: AtomicU64,
    pub timeouts: AtomicU64,
}

impl LockStatsCollector {
    pub fn snapshot(&self, held: u64) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            reentrant_acquisitions: self.reentrant_acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            held,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        assert_eq!(LockContext::Instance.to_string(), "instance");
        assert_eq!(LockContext::Application.to_string(), "app");
        assert_eq!(
            LockContext::Custom("batch".to_string()).to_string(),
            "custom:batch"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_expiry_and_release() {
        let handle = LockHandle::new(
            "jobs/leader",
            LockContext::Application,
            "app-1".to_string(),
            LeaseToken::new("jobs/leader", "lease-1"),
            Duration::from_secs(10),
        );
        assert!(handle.is_valid());
        assert_eq!(handle.remaining(), Duration::from_secs(10));

        let clone = handle.clone();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(clone.remaining(), Duration::from_secs(6));

        assert!(clone.mark_released());
        assert!(!handle.mark_released());
        assert!(handle.is_released());
        assert_eq!(handle.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_attach_renewal_cancels_previous() {
        let handle = LockHandle::new(
            "r",
            LockContext::Instance,
            "i-1".to_string(),
            LeaseToken::new("r", "l"),
            Duration::from_secs(1),
        );
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        handle.attach_renewal(first.clone());
        handle.attach_renewal(second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        handle.mark_released();
        assert!(second.is_cancelled());
        assert!(!handle.has_renewal());
    }
}
