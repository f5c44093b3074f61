//! # Key/Value Store
//!
//! The full store protocol over a versioned key/value backend.
//!
//! ## Versioning
//!
//! Every key carries a modify index. A pull records the config key's index
//! as the snapshot version, and a commit only lands if the key still has
//! that index:
//!
//! ```text
//! pull ──→ apply edit ──→ cas(version) ──ok──→ done
//!              ↑                │
//!              └──── pull ←─conflict   (at most `commit_attempts` times)
//! ```
//!
//! ## Watches
//!
//! One long-poll loop per key, started by the first pull or lookup that
//! touches it. A loop keeps running while a live orchestrator is registered
//! for its key, and releases the key once none is left, so a later
//! orchestrator on the same store gets it polled again.

use super::{CommitOperation, ConfigStore, UpdateHandle, WatchRegistry};
use crate::error::{ConfigError, ConfigResult, StoreError};
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use configurator_document::JsonTree;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts a commit makes before giving up with a conflict
pub const DEFAULT_COMMIT_ATTEMPTS: usize = 3;

/// A stored value and the index of its last write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub value: Vec<u8>,
    pub modify_index: u64,
}

/// Wire operations a key/value service has to offer
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError>;

    /// Write `value` only if the key's modify index is still `index`
    ///
    /// An index of 0 means the key must not exist yet. Returns whether
    /// the write happened.
    async fn cas(&self, key: &str, value: Vec<u8>, index: u64) -> Result<bool, StoreError>;

    /// Block until the key's modify index passes `index` or `wait` elapses,
    /// then return the key's current pair
    async fn watch_get(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Option<KvPair>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KvStoreSettings {
    /// The document lives at `<prefix>/config`
    pub prefix: String,
    pub wait_secs: u64,
    pub retry_delay_ms: u64,
    pub commit_attempts: usize,
}

impl Default for KvStoreSettings {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            wait_secs: 30,
            retry_delay_ms: 1000,
            commit_attempts: DEFAULT_COMMIT_ATTEMPTS,
        }
    }
}

impl KvStoreSettings {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn config_key(&self) -> String {
        format!("{}/config", self.prefix.trim_end_matches('/'))
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

pub struct KvStore<B> {
    backend: Arc<B>,
    settings: KvStoreSettings,
    watches: Arc<WatchRegistry>,
    /// Index of the last successful pull, where new watches start from
    last_index: Arc<AtomicU64>,
}

impl<B> Clone for KvStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
            watches: Arc::clone(&self.watches),
            last_index: Arc::clone(&self.last_index),
        }
    }
}

impl<B: KvBackend> KvStore<B> {
    pub fn new(backend: Arc<B>, settings: KvStoreSettings) -> Self {
        Self {
            backend,
            settings,
            watches: Arc::new(WatchRegistry::new()),
            last_index: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn settings(&self) -> &KvStoreSettings {
        &self.settings
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.watches
    }

    pub fn config_key(&self) -> String {
        self.settings.config_key()
    }

    fn spawn_watch(&self, handle: &UpdateHandle, key: &str) {
        if !handle.is_attached() || !self.watches.register(key, handle) {
            return;
        }
        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            store.poll(&key).await;
        });
    }

    /// Long-poll a claimed key until the registry has nobody left to fire
    async fn poll(&self, key: &str) {
        let mut index = self.last_index.load(Ordering::SeqCst);
        debug!(key = %key, index, "kv store: watching");

        loop {
            match self
                .backend
                .watch_get(key, index, self.settings.wait())
                .await
            {
                Ok(Some(pair)) if pair.modify_index > index => {
                    index = pair.modify_index;
                    info!(key = %key, index, "kv store: change observed");
                    if !self.watches.fire(key) {
                        break;
                    }
                }
                // Wait elapsed without a change
                Ok(_) => {
                    if self.watches.release_if_detached(key) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "kv store: watch failed");
                    tokio::time::sleep(self.settings.retry_delay()).await;
                    if self.watches.release_if_detached(key) {
                        break;
                    }
                }
            }
        }

        debug!(key = %key, "kv store: watch stopped");
    }
}

#[async_trait]
impl<B: KvBackend> ConfigStore for KvStore<B> {
    async fn get(&self, key: &str) -> String {
        match self.backend.get(key).await {
            Ok(Some(pair)) => String::from_utf8_lossy(&pair.value).into_owned(),
            Ok(None) => String::new(),
            Err(err) => {
                warn!(key = %key, error = %err, "kv store: lookup failed");
                String::new()
            }
        }
    }

    async fn watch_to_update(&self, handle: UpdateHandle, key: &str) {
        if !handle.is_attached() || !self.watches.register(key, &handle) {
            return;
        }
        self.poll(key).await;
    }

    async fn pull(&self, handle: &UpdateHandle, snapshot: &mut Snapshot) -> ConfigResult<bool> {
        let key = self.config_key();
        let before = snapshot.document.dump();

        match self.backend.get(&key).await? {
            Some(pair) => {
                snapshot
                    .document
                    .load(&pair.value)
                    .map_err(|source| StoreError::Corrupt {
                        key: key.clone(),
                        source,
                    })?;
                snapshot.version = pair.modify_index;
                self.last_index.fetch_max(pair.modify_index, Ordering::SeqCst);
            }
            None => {
                snapshot.document = JsonTree::new();
                snapshot.version = 0;
            }
        }

        self.spawn_watch(handle, &key);
        Ok(snapshot.document.dump() != before)
    }

    async fn commit(
        &self,
        handle: &UpdateHandle,
        snapshot: &mut Snapshot,
        operation: &mut dyn CommitOperation,
    ) -> ConfigResult<()> {
        let key = self.config_key();
        let attempts = self.settings.commit_attempts.max(1);

        for attempt in 1..=attempts {
            operation.apply(snapshot).await?;

            let written = self
                .backend
                .cas(&key, snapshot.document.dump(), snapshot.version)
                .await?;
            if written {
                debug!(key = %key, attempt, "kv store: committed");
                return Ok(());
            }

            debug!(key = %key, attempt, version = snapshot.version, "kv store: version conflict");
            self.pull(handle, snapshot).await?;
        }

        Err(ConfigError::StoreConflict { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryKv, UpdateTrigger};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Merge {
        key: &'static str,
        applied: usize,
    }

    #[async_trait]
    impl CommitOperation for Merge {
        async fn apply(&mut self, snapshot: &mut Snapshot) -> ConfigResult<()> {
            self.applied += 1;
            snapshot.document.replace(&format!("/{}", self.key), json!(true))?;
            Ok(())
        }
    }

    /// Appends "x" to `/items`, creating the array when it is missing
    struct Push {
        applied: usize,
    }

    #[async_trait]
    impl CommitOperation for Push {
        async fn apply(&mut self, snapshot: &mut Snapshot) -> ConfigResult<()> {
            self.applied += 1;
            if !snapshot.document.is_array("/items") {
                snapshot.document.replace("/items", json!([]))?;
            }
            snapshot.document.append("/items", json!("x"))?;
            Ok(())
        }
    }

    /// Deletes the key right before the first compare-and-set
    struct VanishingKv {
        inner: MemoryKv,
        vanished: AtomicBool,
    }

    #[async_trait]
    impl KvBackend for VanishingKv {
        async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
            self.inner.get(key).await
        }

        async fn cas(&self, key: &str, value: Vec<u8>, index: u64) -> Result<bool, StoreError> {
            if !self.vanished.swap(true, Ordering::SeqCst) {
                self.inner.delete(key);
            }
            self.inner.cas(key, value, index).await
        }

        async fn watch_get(
            &self,
            key: &str,
            index: u64,
            wait: Duration,
        ) -> Result<Option<KvPair>, StoreError> {
            self.inner.watch_get(key, index, wait).await
        }
    }

    /// Counts triggers into a count that outlives the trigger itself
    struct Counter(Arc<AtomicUsize>);

    impl UpdateTrigger for Counter {
        fn trigger_update(&self, _source: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attached(hits: &Arc<AtomicUsize>) -> (Arc<dyn UpdateTrigger>, UpdateHandle) {
        let target: Arc<dyn UpdateTrigger> = Arc::new(Counter(Arc::clone(hits)));
        let handle = UpdateHandle::new(Arc::downgrade(&target));
        (target, handle)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    fn store(kv: &Arc<MemoryKv>) -> KvStore<MemoryKv> {
        KvStore::new(Arc::clone(kv), KvStoreSettings::with_prefix("/app"))
    }

    #[test]
    fn test_settings_defaults() {
        let settings: KvStoreSettings = serde_json::from_str(r#"{"prefix": "/lb"}"#).unwrap();
        assert_eq!(settings.config_key(), "/lb/config");
        assert_eq!(settings.wait(), Duration::from_secs(30));
        assert_eq!(settings.commit_attempts, DEFAULT_COMMIT_ATTEMPTS);
        assert_eq!(KvStoreSettings::default().config_key(), "/config");
    }

    #[tokio::test]
    async fn test_pull_records_version() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("/other", "x");
        let index = kv.put("/app/config", r#"{"b": 2}"#);
        let store = store(&kv);
        let mut snapshot = Snapshot::default();
        let handle = UpdateHandle::detached();

        assert!(store.pull(&handle, &mut snapshot).await.unwrap());
        assert_eq!(snapshot.version, index);
        assert_eq!(snapshot.document.root(), &json!({"b": 2}));
        assert!(!store.pull(&handle, &mut snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_absent_key() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);
        let mut snapshot = Snapshot::default();

        assert!(!store
            .pull(&UpdateHandle::detached(), &mut snapshot)
            .await
            .unwrap());
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn test_pull_corrupt_value() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("/app/config", "[oops");
        let store = store(&kv);
        let mut snapshot = Snapshot::default();

        let err = store
            .pull(&UpdateHandle::detached(), &mut snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Store(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_commit_creates_key() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);
        let handle = UpdateHandle::detached();
        let mut snapshot = Snapshot::default();
        store.pull(&handle, &mut snapshot).await.unwrap();

        let mut op = Merge { key: "a", applied: 0 };
        store.commit(&handle, &mut snapshot, &mut op).await.unwrap();
        assert_eq!(op.applied, 1);

        let stored = kv.get("/app/config").await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&stored.value).unwrap(),
            json!({"a": true})
        );
    }

    #[tokio::test]
    async fn test_commit_retries_after_conflict() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("/app/config", r#"{"base": 1}"#);
        let store = store(&kv);
        let handle = UpdateHandle::detached();
        let mut snapshot = Snapshot::default();
        store.pull(&handle, &mut snapshot).await.unwrap();

        // Another writer gets in between our pull and commit
        kv.put("/app/config", r#"{"base": 1, "theirs": true}"#);

        let mut op = Merge { key: "ours", applied: 0 };
        store.commit(&handle, &mut snapshot, &mut op).await.unwrap();
        assert_eq!(op.applied, 2);
        assert_eq!(
            snapshot.document.root(),
            &json!({"base": 1, "theirs": true, "ours": true})
        );
    }

    #[tokio::test]
    async fn test_pull_absent_key_resets_document() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("/app/config", r#"{"gone": true}"#);
        let store = store(&kv);
        let handle = UpdateHandle::detached();
        let mut snapshot = Snapshot::default();
        store.pull(&handle, &mut snapshot).await.unwrap();

        kv.delete("/app/config");
        assert!(store.pull(&handle, &mut snapshot).await.unwrap());
        assert_eq!(snapshot.document.root(), &json!({}));
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn test_commit_after_key_vanished_applies_edit_once() {
        let backend = Arc::new(VanishingKv {
            inner: MemoryKv::new(),
            vanished: AtomicBool::new(false),
        });
        backend.inner.put("/app/config", r#"{"base": 1}"#);
        let store = KvStore::new(Arc::clone(&backend), KvStoreSettings::with_prefix("/app"));
        let handle = UpdateHandle::detached();
        let mut snapshot = Snapshot::default();
        store.pull(&handle, &mut snapshot).await.unwrap();

        let mut op = Push { applied: 0 };
        store.commit(&handle, &mut snapshot, &mut op).await.unwrap();
        assert_eq!(op.applied, 2);

        let stored = backend.inner.get("/app/config").await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&stored.value).unwrap(),
            json!({"items": ["x"]})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_fires_on_change() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);
        let hits = Arc::new(AtomicUsize::new(0));
        let (_target, handle) = attached(&hits);

        let watcher = store.clone();
        let watch_handle = handle.clone();
        tokio::spawn(async move { watcher.watch_to_update(watch_handle, "/key").await });

        assert!(wait_for(|| store.watches().contains("/key")).await);
        kv.put("/key", "v1");
        assert!(wait_for(|| hits.load(Ordering::SeqCst) > 0).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A second loop on the same key returns straight away
        tokio::time::timeout(
            Duration::from_secs(1),
            store.watch_to_update(handle, "/key"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_detached_handle_claims_nothing() {
        let kv = Arc::new(MemoryKv::new());
        let store = store(&kv);

        tokio::time::timeout(
            Duration::from_secs(1),
            store.watch_to_update(UpdateHandle::detached(), "/key"),
        )
        .await
        .unwrap();
        store
            .pull(&UpdateHandle::detached(), &mut Snapshot::default())
            .await
            .unwrap();
        assert!(store.watches().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_passes_to_next_orchestrator() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("/app/config", r#"{"rev": 1}"#);
        let store = store(&kv);

        let first = Arc::new(AtomicUsize::new(0));
        let (first_target, first_handle) = attached(&first);
        store
            .pull(&first_handle, &mut Snapshot::default())
            .await
            .unwrap();
        assert!(store.watches().contains("/app/config"));
        drop(first_target);

        let second = Arc::new(AtomicUsize::new(0));
        let (_second_target, second_handle) = attached(&second);
        store
            .pull(&second_handle, &mut Snapshot::default())
            .await
            .unwrap();

        kv.put("/app/config", r#"{"rev": 2}"#);
        assert!(wait_for(|| second.load(Ordering::SeqCst) > 0).await);
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_releases_key_when_orchestrator_dropped() {
        let kv = Arc::new(MemoryKv::new());
        let store = KvStore::new(
            Arc::clone(&kv),
            KvStoreSettings {
                prefix: "/app".into(),
                wait_secs: 0,
                retry_delay_ms: 10,
                ..Default::default()
            },
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let (target, handle) = attached(&hits);
        store.pull(&handle, &mut Snapshot::default()).await.unwrap();
        assert!(store.watches().contains("/app/config"));

        drop(target);
        assert!(wait_for(|| store.watches().is_empty()).await);
    }
}
