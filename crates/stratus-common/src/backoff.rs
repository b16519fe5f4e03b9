//! Exponential backoff with jitter and cancellable sleeps
//!
//! Every blocking loop in Stratus (lock acquisition, queue polling, index
//! commit retries, transient storage retries) waits through these helpers so
//! no loop ever busy-spins and every wait observes cancellation.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::error::{Result, StratusError};

/// Stateful exponential backoff schedule.
///
/// The n-th delay is `min(base * 2^n, max) + uniform(0..=jitter)`.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_ms: u64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base(),
            max: config.max(),
            jitter_ms: config.jitter_ms,
            current: config.base(),
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts += 1;

        let jitter = if self.jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=self.jitter_ms))
        } else {
            Duration::ZERO
        };
        delay + jitter
    }

    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StratusError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Spans at least this long are treated as unbounded.
pub const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `at + span`, capping `span` at [`FOREVER`] so that `Duration::MAX` and
/// other huge spans mean "never" instead of overflowing.
pub fn saturating_add(at: Instant, span: Duration) -> Instant {
    at + span.min(FOREVER)
}

/// The instant `span` from now; see [`saturating_add`].
pub fn deadline_after(span: Duration) -> Instant {
    saturating_add(Instant::now(), span)
}

/// Errors that can tell a transient failure from a permanent one
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StratusError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `max_attempts` calls have been made.
///
/// `on_retry` is invoked with the attempt number before each backoff sleep.
pub async fn retry_transient<T, E, F, Fut, R>(
    config: &BackoffConfig,
    max_attempts: u32,
    mut on_retry: R,
    mut op: F,
) -> std::result::Result<T, E>
where
    E: Transient,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: FnMut(u32, &E),
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                on_retry(attempt, &e);
                tokio::time::sleep(backoff.next_delay()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(&BackoffConfig::new(10, 50, 0));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
        assert_eq!(backoff.attempts(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let mut backoff = Backoff::new(&BackoffConfig::new(100, 100, 25));
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(1), &cancel).await.is_ok());

        cancel.cancel();
        let result = sleep_or_cancel(Duration::from_secs(3600), &cancel).await;
        assert!(matches!(result, Err(StratusError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_spans_do_not_overflow() {
        let now = Instant::now();
        assert_eq!(saturating_add(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(saturating_add(now, Duration::MAX), now + FOREVER);
        assert!(deadline_after(Duration::MAX) > now + Duration::from_secs(60 * 60 * 24 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();

        let result: Result<()> = retry_transient(
            &BackoffConfig::new(10, 100, 0),
            3,
            |attempt, _: &StratusError| retries.push(attempt),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StratusError::StorageUnavailable("throttled".to_string()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(StratusError::StorageUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_does_not_retry_contention() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry_transient(
            &BackoffConfig::default(),
            5,
            |_, _| {},
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StratusError::not_holder("lock"))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(StratusError::NotHolder { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<i32> = retry_transient(
            &BackoffConfig::new(5, 5, 0),
            3,
            |_, _| {},
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StratusError::StorageUnavailable("blip".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }
}
