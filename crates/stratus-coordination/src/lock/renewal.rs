//! Background renewal of leases longer than the store grants in one call

use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::model::LockHandle;
use crate::store_client::StoreClient;

/// Keeps a lock's store lease alive until `until`, renewing every `interval`
/// for at most `slice` at a time.
pub(crate) struct AutoRenewalTask {
    store: StoreClient,
    handle: LockHandle,
    interval: Duration,
    slice: Duration,
    until: Instant,
}

impl AutoRenewalTask {
    /// Spawn the renewal task; it stops when the handle is released or renewed again.
    pub fn start(
        store: StoreClient,
        handle: &LockHandle,
        interval: Duration,
        slice: Duration,
        until: Instant,
    ) {
        let stop = CancellationToken::new();
        handle.attach_renewal(stop.clone());

        let task = Self {
            store,
            handle: handle.clone(),
            interval,
            slice,
            until,
        };
        tokio::spawn(task.run(stop));
    }

    async fn run(self, stop: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        let resource = self.handle.resource_id().to_string();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if now >= self.until {
                        break;
                    }
                    let left = self.until - now;
                    let lease = self.slice.min(left);

                    match self.store.lease_renew(self.handle.token(), lease).await {
                        Ok(()) => {
                            debug!(resource = %resource, lease = ?lease, "Lock lease renewed");
                            if left <= self.slice {
                                break;
                            }
                        }
                        Err(_) if stop.is_cancelled() => break,
                        Err(e) => {
                            warn!(resource = %resource, error = %e, "Lock renewal failed, lock is lost");
                            self.handle.set_expires_at(now);
                            break;
                        }
                    }
                }
            }
        }
    }
}
