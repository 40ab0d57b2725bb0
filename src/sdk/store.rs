use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::engine::{BlobStore, Collection, FallbackBackend, FileBlobStore, SqliteBackend};
use crate::records::Record;
use crate::sdk::StoreConfig;
use crate::snapshot::{self, Snapshot};
use crate::{Backend, CollectionReader, CollectionWriter, Error, Key, Result};

/// Blob key holding the periodic full-export backup.
pub const BACKUP_KEY: &str = "novelWriterBackup";

/// Which backend serves operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    /// The primary is still opening.
    Initializing,
    /// Operations go to the primary backend.
    Primary,
    /// Operations go to the fallback backend for the rest of the session.
    Degraded { reason: String },
}

/// The persistence facade shared by every feature of the workspace.
///
/// Construction starts opening the primary backend in the background and
/// returns immediately. Each operation is routed to the primary while it is
/// live; if the primary is absent, or a call to it fails with a backend
/// failure, the call is served by the fallback and the store moves to
/// [`BackendState::Degraded`]. The store never moves back to the primary
/// within a session.
///
/// Contract errors raised by the primary (duplicate key, unknown index,
/// malformed record) are returned as-is and do not degrade the store.
pub struct Store {
    config: StoreConfig,
    primary: Arc<OnceLock<Arc<dyn Backend>>>,
    fallback: Arc<FallbackBackend>,
    blobs: Arc<dyn BlobStore>,
    state: Arc<watch::Sender<BackendState>>,
}

/// Records the transition to degraded mode. Only the first call has an effect.
fn mark_degraded(state: &watch::Sender<BackendState>, reason: String) -> bool {
    let changed = state.send_if_modified(|current| {
        if matches!(current, BackendState::Degraded { .. }) {
            false
        } else {
            *current = BackendState::Degraded {
                reason: reason.clone(),
            };
            true
        }
    });
    if changed {
        warn!("Primary storage unavailable, continuing with fallback storage: {}", reason);
    }
    changed
}

fn finish<T>(result: Result<T>, primary_error: Option<String>) -> Result<T> {
    match (result, primary_error) {
        (Err(fallback), Some(primary)) => Err(Error::BothBackendsFailed {
            primary,
            fallback: fallback.to_string(),
        }),
        (result, _) => result,
    }
}

/// Runs `$call` against the live primary, then against the fallback if the
/// primary is absent or fails with a backend failure.
macro_rules! route {
    ($store:ident, $op:literal, $collection:expr, |$backend:ident| $call:expr) => {{
        let mut primary_error = None;
        if let Some($backend) = $store.active_primary().await {
            match $call.await {
                Ok(out) => return Ok(out),
                Err(e) => primary_error = Some($store.on_primary_error($op, $collection, e)?),
            }
        }
        let $backend = &$store.fallback;
        finish($call.await, primary_error)
    }};
}

impl Store {
    /// Opens the store described by `config`: file blobs under `data_dir` for
    /// the fallback, and the SQLite database at [`StoreConfig::database_path`]
    /// for the primary unless `disable_primary` is set.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(&config.data_dir)?);
        if config.disable_primary {
            return Store::degraded(config, blobs, "primary storage disabled by configuration");
        }

        let path = config.database_path();
        Store::with_primary(config, blobs, async move {
            let backend = tokio::task::spawn_blocking(move || SqliteBackend::open(path))
                .await
                .map_err(|e| Error::Initialization(e.to_string()))??;
            Ok::<Arc<dyn Backend>, Error>(Arc::new(backend))
        })
    }

    /// Builds a store whose primary backend is produced by `init`, which is
    /// spawned immediately.
    pub fn with_primary<F>(config: StoreConfig, blobs: Arc<dyn BlobStore>, init: F) -> Result<Self>
    where
        F: Future<Output = Result<Arc<dyn Backend>>> + Send + 'static,
    {
        let store = Store::initializing(config, blobs)?;
        let slot = store.primary.clone();
        let state = store.state.clone();

        tokio::spawn(async move {
            match init.await {
                Ok(backend) => {
                    let name = backend.name();
                    let _ = slot.set(backend);
                    let promoted = state.send_if_modified(|current| {
                        if *current == BackendState::Initializing {
                            *current = BackendState::Primary;
                            true
                        } else {
                            false
                        }
                    });
                    if promoted {
                        info!("Primary storage ({}) ready", name);
                    } else {
                        warn!("Primary storage ({}) opened after the store degraded; it stays unused", name);
                    }
                }
                Err(Error::Initialization(reason)) => {
                    mark_degraded(&state, reason);
                }
                Err(e) => {
                    mark_degraded(&state, e.to_string());
                }
            }
        });

        Ok(store)
    }

    /// Builds a store that serves everything from the fallback backend.
    pub fn degraded(config: StoreConfig, blobs: Arc<dyn BlobStore>, reason: &str) -> Result<Self> {
        let store = Store::initializing(config, blobs)?;
        mark_degraded(&store.state, reason.to_string());
        Ok(store)
    }

    fn initializing(config: StoreConfig, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let fallback = Arc::new(FallbackBackend::load(blobs.clone())?);
        let (state, _) = watch::channel(BackendState::Initializing);
        Ok(Self {
            config,
            primary: Arc::new(OnceLock::new()),
            fallback,
            blobs,
            state: Arc::new(state),
        })
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current routing state.
    pub fn state(&self) -> BackendState {
        self.state.borrow().clone()
    }

    /// Whether every call is now served by the fallback.
    pub fn is_degraded(&self) -> bool {
        matches!(*self.state.borrow(), BackendState::Degraded { .. })
    }

    /// A receiver notified when the store leaves `Initializing` and when it degrades.
    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state.subscribe()
    }

    /// Resolves once the primary is either live or abandoned.
    pub async fn ready(&self) -> BackendState {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| *s != BackendState::Initializing)
            .await
            .map(|s| s.clone());
        settled.unwrap_or_else(|_| self.state())
    }

    /// Polls for readiness up to `attempts` times. Returns whether initialization settled.
    pub async fn wait_ready_polling(&self, attempts: u32, interval: Duration) -> bool {
        for attempt in 0..=attempts {
            if *self.state.borrow() != BackendState::Initializing {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        false
    }

    async fn active_primary(&self) -> Option<Arc<dyn Backend>> {
        let settled = self
            .wait_ready_polling(self.config.ready_poll_attempts, self.config.ready_poll_interval)
            .await;
        if !settled {
            mark_degraded(&self.state, "primary storage did not become ready in time".to_string());
        }
        match *self.state.borrow() {
            BackendState::Primary => self.primary.get().cloned(),
            _ => None,
        }
    }

    /// Decides whether a primary error is retried on the fallback. Returns the
    /// error text to carry along, or the error itself when it must propagate.
    fn on_primary_error(&self, op: &str, collection: Collection, err: Error) -> Result<String> {
        if !err.is_backend_failure() {
            return Err(err);
        }
        debug!("primary {} on {} failed: {}", op, collection, err);
        mark_degraded(&self.state, format!("{} on {} failed: {}", op, collection, err));
        Ok(err.to_string())
    }

    /// Inserts a record, assigning an id for auto-keyed collections.
    pub async fn add(&self, collection: Collection, record: Value) -> Result<Value> {
        route!(self, "add", collection, |backend| backend.add(collection, record.clone()))
    }

    /// Inserts or fully replaces the record with the same key.
    pub async fn update(&self, collection: Collection, record: Value) -> Result<Value> {
        route!(self, "update", collection, |backend| backend.update(collection, record.clone()))
    }

    /// Removes a record by key. Removing an absent key succeeds.
    pub async fn delete(&self, collection: Collection, key: &Key) -> Result<()> {
        collection.check_key(key)?;
        route!(self, "delete", collection, |backend| backend.delete(collection, key))
    }

    /// Removes every record of the collection.
    pub async fn clear(&self, collection: Collection) -> Result<()> {
        route!(self, "clear", collection, |backend| backend.clear(collection))
    }

    /// Retrieves one record by key, or `None` if absent.
    pub async fn get(&self, collection: Collection, key: &Key) -> Result<Option<Value>> {
        collection.check_key(key)?;
        route!(self, "get", collection, |backend| backend.get(collection, key))
    }

    /// Every record of the collection in store-native order.
    pub async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        route!(self, "get_all", collection, |backend| backend.get_all(collection))
    }

    /// Records whose indexed field equals `value`, in store-native order.
    pub async fn get_all_by_index(&self, collection: Collection, index: &str, value: &Value) -> Result<Vec<Value>> {
        route!(self, "get_all_by_index", collection, |backend| backend
            .get_all_by_index(collection, index, value))
    }

    /// Typed [`Store::add`].
    pub async fn add_generic<R: Record>(&self, record: &R) -> Result<R> {
        let stored = self.add(R::COLLECTION, serde_json::to_value(record)?).await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Typed [`Store::update`].
    pub async fn update_generic<R: Record>(&self, record: &R) -> Result<R> {
        let stored = self.update(R::COLLECTION, serde_json::to_value(record)?).await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Typed [`Store::get`].
    pub async fn get_generic<R: Record>(&self, key: impl Into<Key>) -> Result<Option<R>> {
        match self.get(R::COLLECTION, &key.into()).await? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    /// Typed [`Store::get_all`].
    pub async fn get_all_generic<R: Record>(&self) -> Result<Vec<R>> {
        self.get_all(R::COLLECTION)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    /// Typed [`Store::get_all_by_index`].
    pub async fn get_all_by_index_generic<R: Record>(&self, index: &str, value: impl Into<Value>) -> Result<Vec<R>> {
        self.get_all_by_index(R::COLLECTION, index, &value.into())
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    /// Returns the stored value of a setting, or `default` when it was never set
    /// or holds a value that does not decode as `T`.
    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        let record = self.get(Collection::Settings, &Key::from(key)).await?;
        match record.as_ref().and_then(|r| r.get("value")) {
            Some(value) if !value.is_null() => match serde_json::from_value(value.clone()) {
                Ok(decoded) => Ok(decoded),
                Err(e) => {
                    warn!("Setting {} has an unexpected value {}: {}", key, value, e);
                    Ok(default)
                }
            },
            _ => Ok(default),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub async fn set_setting<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let record = json!({ "key": key, "value": serde_json::to_value(value)? });
        self.update(Collection::Settings, record).await?;
        Ok(())
    }

    /// Snapshot of every collection, served by whichever backend is active.
    pub async fn export_data(&self) -> Result<Snapshot> {
        snapshot::export_from(self).await
    }

    /// Replaces each collection present in `snapshot`. Destructive per collection.
    pub async fn import_data(&self, snapshot: &Snapshot) -> Result<()> {
        snapshot::import_into(self, snapshot).await
    }

    /// Copies a full export of the live primary into the backup blob.
    ///
    /// Returns `false` without writing anything when the primary is not live.
    pub async fn backup_now(&self) -> Result<bool> {
        let primary = match *self.state.borrow() {
            BackendState::Primary => self.primary.get().cloned(),
            _ => None,
        };
        let Some(primary) = primary else {
            return Ok(false);
        };

        let snapshot = snapshot::export_from(primary.as_ref()).await?;
        self.blobs.set(BACKUP_KEY, &serde_json::to_string(&snapshot)?)?;
        debug!("Backed up {} records", snapshot.record_count());
        Ok(true)
    }

    /// Whether a backup blob exists.
    pub fn has_backup(&self) -> Result<bool> {
        Ok(self.blobs.get(BACKUP_KEY)?.is_some())
    }

    /// Imports the last backup into the store. Returns `false` if there is none.
    pub async fn restore_from_backup(&self) -> Result<bool> {
        let Some(raw) = self.blobs.get(BACKUP_KEY)? else {
            return Ok(false);
        };
        let snapshot = Snapshot::from_json(&raw)?;
        self.import_data(&snapshot).await?;
        info!("Restored {} records from backup", snapshot.record_count());
        Ok(true)
    }
}

#[async_trait]
impl CollectionReader for Store {
    async fn get(&self, collection: Collection, key: &Key) -> Result<Option<Value>> {
        Store::get(self, collection, key).await
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        Store::get_all(self, collection).await
    }

    async fn get_all_by_index(&self, collection: Collection, index: &str, value: &Value) -> Result<Vec<Value>> {
        Store::get_all_by_index(self, collection, index, value).await
    }
}

#[async_trait]
impl CollectionWriter for Store {
    async fn add(&self, collection: Collection, record: Value) -> Result<Value> {
        Store::add(self, collection, record).await
    }

    async fn update(&self, collection: Collection, record: Value) -> Result<Value> {
        Store::update(self, collection, record).await
    }

    async fn delete(&self, collection: Collection, key: &Key) -> Result<()> {
        Store::delete(self, collection, key).await
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        Store::clear(self, collection).await
    }
}
