//! Entry point wiring the primitives to one store and configuration

use std::sync::Arc;

use stratus_common::{Result, StratusConfig, StratusError};
use stratus_store::StoreAdapter;
use tracing::info;

use crate::dictionary::{DictionaryKind, RemoteDictionary};
use crate::index::IndexManager;
use crate::lock::LockManager;
use crate::queue::RemoteQueue;
use crate::store_client::StoreClient;

struct CoordinatorInner {
    app_id: String,
    config: StratusConfig,
    store: StoreClient,
    locks: LockManager,
}

/// One application's view of a Stratus store.
///
/// Every primitive handed out shares the coordinator's configuration and
/// its application id, which scopes application-context locks.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("app_id", &self.inner.app_id)
            .finish()
    }
}

impl Coordinator {
    /// Create a coordinator with a fresh application id.
    pub fn new(store: Arc<dyn StoreAdapter>, config: StratusConfig) -> Result<Self> {
        Self::with_app_id(store, config, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_app_id(
        store: Arc<dyn StoreAdapter>,
        config: StratusConfig,
        app_id: impl Into<String>,
    ) -> Result<Self> {
        let app_id = app_id.into();
        if app_id.is_empty() {
            return Err(StratusError::Config("application id is empty".to_string()));
        }
        config.validate()?;

        let store = StoreClient::new(store, config.storage.clone());
        let locks = LockManager::new(store.clone(), config.lock.clone(), app_id.clone());
        info!(app_id = %app_id, "Coordinator started");

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                app_id,
                config,
                store,
                locks,
            }),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn config(&self) -> &StratusConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &StoreClient {
        &self.inner.store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Handle to queue `name`; call [`RemoteQueue::create`] before first use.
    pub fn queue(&self, name: &str) -> RemoteQueue {
        RemoteQueue::new(
            name,
            self.inner.store.clone(),
            self.inner.config.queue.clone(),
        )
    }

    pub fn dictionary(&self, root: &str, kind: DictionaryKind) -> Result<RemoteDictionary> {
        RemoteDictionary::new(
            root,
            kind,
            self.inner.store.clone(),
            &self.inner.locks,
            self.inner.config.index.clone(),
            &self.inner.config.dictionary,
        )
    }

    /// Index manager for a standalone index object at `path`
    pub fn index_manager(&self, path: &str) -> IndexManager {
        IndexManager::new(
            path,
            self.inner.store.clone(),
            self.inner.locks.clone(),
            self.inner.config.index.clone(),
        )
    }
}
