//! Lock acquisition, renewal and release against the store

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use stratus_common::{
    Backoff, LockConfig, Result, StratusError, deadline_after, metric_names, sleep_or_cancel,
};
use stratus_store::{LeaseInfo, LeaseToken, StoreError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::model::{AcquireOptions, LockContext, LockHandle, LockStats, LockStatsCollector};
use super::renewal::AutoRenewalTask;
use crate::store_client::StoreClient;

/// Distributed lock manager.
///
/// The store lease is keyed by the resource id alone, so exactly one holder
/// exists per resource across every process. Which in-process callers count
/// as that holder is decided locally from the [`LockContext`]:
/// - `Instance`: this manager instance only (see [`LockManager::for_instance`])
/// - `Application`: every manager sharing this application id
/// - `Custom(label)`: every caller in this application using the same label
#[derive(Clone)]
pub struct LockManager {
    store: StoreClient,
    config: LockConfig,
    app_id: Arc<str>,
    instance_id: Arc<str>,
    /// Locks held by this application, keyed by resource id
    registry: Arc<DashMap<String, LockHandle>>,
    stats: Arc<LockStatsCollector>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("app_id", &self.app_id)
            .field("instance_id", &self.instance_id)
            .field("held", &self.registry.len())
            .finish()
    }
}

impl LockManager {
    pub fn new(store: StoreClient, config: LockConfig, app_id: impl Into<String>) -> Self {
        Self {
            store,
            config,
            app_id: Arc::from(app_id.into()),
            instance_id: Arc::from(uuid::Uuid::new_v4().to_string()),
            registry: Arc::new(DashMap::new()),
            stats: Arc::new(LockStatsCollector::default()),
        }
    }

    /// A manager for a new instance of the same application.
    ///
    /// It shares application- and custom-context locks with `self` but owns
    /// its own instance-context locks.
    pub fn for_instance(&self) -> Self {
        Self {
            instance_id: Arc::from(uuid::Uuid::new_v4().to_string()),
            ..self.clone()
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn holder_for(&self, context: &LockContext) -> String {
        match context {
            LockContext::Instance => format!("{}/{}", self.app_id, self.instance_id),
            LockContext::Application => self.app_id.to_string(),
            LockContext::Custom(label) => format!("{}_{}", label, self.app_id),
        }
    }

    /// Acquire `resource` with the default lease, waiting up to `timeout`.
    pub async fn acquire(
        &self,
        resource: &str,
        context: LockContext,
        timeout: Duration,
    ) -> Result<LockHandle> {
        self.acquire_with(resource, context, AcquireOptions::new().timeout(timeout))
            .await
    }

    /// Acquire `resource`, backing off with jitter while it is contended.
    ///
    /// Fails with `LockTimeout` once the timeout elapses and with `Cancelled`
    /// when the cancellation token fires during a wait.
    pub async fn acquire_with(
        &self,
        resource: &str,
        context: LockContext,
        options: AcquireOptions,
    ) -> Result<LockHandle> {
        check_resource(resource)?;
        let lease = options.lease.unwrap_or_else(|| self.config.lease_duration());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.acquire_timeout());
        let cancel = options.cancel.unwrap_or_default();
        let holder = self.holder_for(&context);

        if let Some(handle) = self.reenter(resource, &context, &holder, lease).await? {
            return Ok(handle);
        }

        let deadline = deadline_after(timeout);
        let mut backoff = Backoff::new(&self.config.backoff);

        loop {
            if cancel.is_cancelled() {
                return Err(StratusError::Cancelled);
            }

            if let Some(handle) = self.try_lease(resource, &context, &holder, lease).await? {
                return Ok(handle);
            }
            self.record_contention();

            let now = Instant::now();
            if now >= deadline {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric_names::LOCK_TIMEOUT).increment(1);
                warn!(resource, attempts = backoff.attempts() + 1, "Lock acquisition timed out");
                return Err(StratusError::LockTimeout {
                    resource: resource.to_string(),
                    waited: timeout,
                });
            }

            let delay = backoff.next_delay().min(deadline - now);
            debug!(resource, attempt = backoff.attempts(), delay = ?delay, "Lock contended, backing off");
            sleep_or_cancel(delay, &cancel).await?;
        }
    }

    /// Single acquisition attempt with the default lease.
    pub async fn try_acquire(
        &self,
        resource: &str,
        context: LockContext,
    ) -> Result<Option<LockHandle>> {
        check_resource(resource)?;
        let lease = self.config.lease_duration();
        let holder = self.holder_for(&context);

        if let Some(handle) = self.reenter(resource, &context, &holder, lease).await? {
            return Ok(Some(handle));
        }
        let acquired = self.try_lease(resource, &context, &holder, lease).await?;
        if acquired.is_none() {
            self.record_contention();
        }
        Ok(acquired)
    }

    /// Reuse a lock this holder already has: instance and custom contexts
    /// without touching the store, the application context through a renewal.
    async fn reenter(
        &self,
        resource: &str,
        context: &LockContext,
        holder: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>> {
        let Some(existing) = self.registry.get(resource).map(|h| h.clone()) else {
            return Ok(None);
        };
        if existing.holder() != holder {
            return Ok(None);
        }
        if !existing.is_valid() {
            self.unregister(&existing);
            return Ok(None);
        }

        if *context == LockContext::Application {
            match self.renew(&existing, lease).await {
                Ok(()) => {}
                Err(StratusError::NotHolder { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        self.stats
            .reentrant_acquisitions
            .fetch_add(1, Ordering::Relaxed);
        debug!(resource, context = %context, "Lock re-entered");
        Ok(Some(existing))
    }

    async fn try_lease(
        &self,
        resource: &str,
        context: &LockContext,
        holder: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>> {
        let slice = lease.min(self.config.max_store_lease());
        let token = match self.store.lease_acquire(resource, slice).await {
            Ok(token) => token,
            Err(StoreError::Conflict(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let handle = LockHandle::new(resource, context.clone(), holder.to_string(), token, lease);
        if lease > slice {
            self.start_renewal(&handle, lease);
        }
        self.registry.insert(resource.to_string(), handle.clone());

        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_names::LOCK_ACQUIRED).increment(1);
        debug!(resource, context = %context, lease = ?lease, "Lock acquired");
        Ok(Some(handle))
    }

    fn start_renewal(&self, handle: &LockHandle, lease: Duration) {
        AutoRenewalTask::start(
            self.store.clone(),
            handle,
            self.config.renew_interval(),
            self.config.max_store_lease(),
            deadline_after(lease),
        );
    }

    fn record_contention(&self) {
        self.stats.contentions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric_names::LOCK_CONTENTION).increment(1);
    }

    fn unregister(&self, handle: &LockHandle) {
        self.registry
            .remove_if(handle.resource_id(), |_, held| held.same_lease(handle));
    }

    /// Extend the lock to `duration` from now.
    ///
    /// Fails with `NotHolder` when the handle was released or its lease is
    /// now held by someone else.
    pub async fn renew(&self, handle: &LockHandle, duration: Duration) -> Result<()> {
        if handle.is_released() {
            return Err(StratusError::not_holder(handle.resource_id()));
        }

        let slice = duration.min(self.config.max_store_lease());
        match self.store.lease_renew(handle.token(), slice).await {
            Ok(()) => {
                handle.set_expires_at(deadline_after(duration));
                if duration > slice {
                    self.start_renewal(handle, duration);
                } else {
                    handle.stop_renewal();
                }
                self.stats.renewals.fetch_add(1, Ordering::Relaxed);
                debug!(resource = handle.resource_id(), duration = ?duration, "Lock renewed");
                Ok(())
            }
            Err(StoreError::NotHolder(_)) => {
                handle.mark_released();
                self.unregister(handle);
                Err(StratusError::not_holder(handle.resource_id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock.
    ///
    /// A no-op for handles that are already released or expired. Fails with
    /// `NotHolder` when the lease was taken over while the handle still
    /// believed it was valid.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        if !handle.mark_released() {
            return Ok(());
        }
        self.unregister(handle);
        let expired = handle.is_expired();

        match self.store.lease_release(handle.token()).await {
            Ok(()) => {
                self.stats.releases.fetch_add(1, Ordering::Relaxed);
                debug!(resource = handle.resource_id(), "Lock released");
                Ok(())
            }
            Err(StoreError::NotHolder(_)) if expired => Ok(()),
            Err(StoreError::NotHolder(_)) => {
                warn!(resource = handle.resource_id(), "Lock was taken over before release");
                Err(StratusError::not_holder(handle.resource_id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release `resource` if `context` holds it here; `NotHolder` when
    /// someone else holds it, success when nobody does.
    pub async fn release_resource(&self, resource: &str, context: &LockContext) -> Result<()> {
        let holder = self.holder_for(context);
        let held = self.registry.get(resource).map(|h| h.clone());
        if let Some(handle) = held
            && handle.holder() == holder
            && !handle.is_released()
        {
            return self.release(&handle).await;
        }

        match self.store.lease_status(resource).await? {
            Some(_) => Err(StratusError::not_holder(resource)),
            None => Ok(()),
        }
    }

    /// The valid handle `context` holds on `resource`, if any
    pub fn held(&self, resource: &str, context: &LockContext) -> Option<LockHandle> {
        let holder = self.holder_for(context);
        self.registry
            .get(resource)
            .filter(|handle| handle.holder() == holder && handle.is_valid())
            .map(|handle| handle.clone())
    }

    /// Lease token this manager may write `resource` under.
    ///
    /// Application and custom locks are usable by every manager of the
    /// application; instance locks only by the instance that took them.
    pub fn token_for(&self, resource: &str) -> Option<LeaseToken> {
        let handle = self.registry.get(resource)?;
        if !handle.is_valid() {
            return None;
        }
        let usable = match handle.context() {
            LockContext::Instance => handle.holder() == self.holder_for(&LockContext::Instance),
            LockContext::Application | LockContext::Custom(_) => true,
        };
        usable.then(|| handle.token().clone())
    }

    pub async fn is_locked(&self, resource: &str) -> Result<bool> {
        Ok(self.store.lease_status(resource).await?.is_some())
    }

    pub async fn lock_info(&self, resource: &str) -> Result<Option<LeaseInfo>> {
        Ok(self.store.lease_status(resource).await?)
    }

    /// Break whatever lease is live on `resource` (admin operation).
    ///
    /// Returns false when the resource was not locked.
    pub async fn force_release(&self, resource: &str) -> Result<bool> {
        let Some(info) = self.store.lease_status(resource).await? else {
            return Ok(false);
        };
        match self
            .store
            .lease_release(&LeaseToken::new(resource, info.lease_id))
            .await
        {
            Ok(()) => {}
            // Lapsed and re-taken between status and release
            Err(StoreError::NotHolder(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let Some((_, handle)) = self.registry.remove(resource) {
            handle.mark_released();
        }
        info!(resource, "Lock force released");
        Ok(true)
    }

    /// Run `f` while holding `resource`; the lock is released afterwards
    /// whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        context: LockContext,
        options: AcquireOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire_with(resource, context, options).await?;
        let result = f(handle.clone()).await;
        if let Err(e) = self.release(&handle).await {
            warn!(resource, error = %e, "Failed to release lock after scoped use");
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    pub fn stats(&self) -> LockStats {
        let held = self
            .registry
            .iter()
            .filter(|handle| handle.is_valid())
            .count() as u64;
        self.stats.snapshot(held)
    }
}

fn check_resource(resource: &str) -> Result<()> {
    if resource.is_empty() {
        return Err(StratusError::invalid_key(resource, "resource id is empty"));
    }
    Ok(())
}
