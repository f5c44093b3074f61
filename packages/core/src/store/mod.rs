//! # Store Contract
//!
//! What the orchestrator needs from a backing store:
//!
//! - **get**: best-effort point read for directive lookups
//! - **pull**: load the authoritative document and its version
//! - **commit**: optimistic compare-and-set with bounded retry
//! - **watch_to_update**: long-poll a key and trigger a re-render on change
//!
//! Two implementations ship here. [`FileStore`] is a single-writer JSON
//! file with no watch support. [`KvStore`] runs the full protocol over any
//! [`KvBackend`], such as the in-process [`MemoryKv`].

mod file;
mod kv;
mod memory;

pub use file::FileStore;
pub use kv::{KvBackend, KvPair, KvStore, KvStoreSettings, DEFAULT_COMMIT_ATTEMPTS};
pub use memory::MemoryKv;

use crate::error::ConfigResult;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

/// Something that can schedule a full re-render
pub trait UpdateTrigger: Send + Sync {
    /// Schedule an update in the background; `source` names what changed
    fn trigger_update(&self, source: &str);
}

/// Weak reference to the orchestrator handed to watch loops
///
/// Watches never keep the orchestrator alive. Once it is dropped,
/// [`fire`](Self::fire) returns `false`, and the loop moves on to a newer
/// handle for the same key or winds down.
#[derive(Clone)]
pub struct UpdateHandle {
    target: Weak<dyn UpdateTrigger>,
}

struct Detached;

impl UpdateTrigger for Detached {
    fn trigger_update(&self, _source: &str) {}
}

impl UpdateHandle {
    pub fn new(target: Weak<dyn UpdateTrigger>) -> Self {
        Self { target }
    }

    /// A handle with nothing behind it
    pub fn detached() -> Self {
        let target: Weak<dyn UpdateTrigger> = Weak::<Detached>::new();
        Self { target }
    }

    pub fn is_attached(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Trigger an update, returning `false` if the target is gone
    pub fn fire(&self, source: &str) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.trigger_update(source);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for UpdateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// The edit run inside a commit attempt
///
/// It mutates the snapshot in place; returning an error aborts the commit
/// without touching the store.
#[async_trait]
pub trait CommitOperation: Send {
    async fn apply(&mut self, snapshot: &mut Snapshot) -> ConfigResult<()>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Value under `key`, or an empty string if it is absent or unreadable
    async fn get(&self, key: &str) -> String;

    /// Long-poll `key` and fire `handle` whenever it changes
    ///
    /// Runs until no live orchestrator is registered for `key`. Returns at
    /// once if `handle` is detached or a loop already polls `key`, in which
    /// case that loop takes `handle` over if its own target is gone.
    async fn watch_to_update(&self, handle: UpdateHandle, key: &str);

    /// Load the stored document and its version into `snapshot`
    ///
    /// Returns whether the document changed. Also makes sure the config
    /// key is being watched through `handle`.
    async fn pull(&self, handle: &UpdateHandle, snapshot: &mut Snapshot) -> ConfigResult<bool>;

    /// Run `operation` and write the result back against the snapshot's
    /// version, re-pulling and retrying on conflict
    async fn commit(
        &self,
        handle: &UpdateHandle,
        snapshot: &mut Snapshot,
        operation: &mut dyn CommitOperation,
    ) -> ConfigResult<()>;
}

/// Keys currently being long-polled, with the handle each loop fires
///
/// A key stays claimed while its loop runs. When the orchestrator behind a
/// claim is dropped, a later claim on the same key takes over the running
/// loop; if nobody takes over, the loop releases the key and stops.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    keys: Mutex<HashMap<String, UpdateHandle>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `handle`
    ///
    /// Returns `true` if the caller has to start the loop. Returns `false`
    /// if a loop already runs; `handle` replaces the loop's handle when the
    /// old one has nothing behind it.
    pub fn register(&self, key: &str, handle: &UpdateHandle) -> bool {
        let mut keys = self.keys();
        match keys.get_mut(key) {
            Some(current) => {
                if !current.is_attached() {
                    *current = handle.clone();
                }
                false
            }
            None => {
                keys.insert(key.to_string(), handle.clone());
                true
            }
        }
    }

    /// Fire the handle currently registered for `key`
    ///
    /// Returns `false` once nobody is left to fire, in which case the key
    /// has been released and the loop should stop.
    pub fn fire(&self, key: &str) -> bool {
        loop {
            let Some(handle) = self.handle(key) else {
                return false;
            };
            if handle.fire(key) {
                return true;
            }
            if self.release_if_detached(key) {
                return false;
            }
        }
    }

    /// Drop the claim on `key` if its handle has nothing behind it
    ///
    /// Returns whether the key is now unclaimed.
    pub fn release_if_detached(&self, key: &str) -> bool {
        let mut keys = self.keys();
        match keys.get(key) {
            Some(handle) if handle.is_attached() => false,
            Some(_) => {
                keys.remove(key);
                true
            }
            None => true,
        }
    }

    pub fn handle(&self, key: &str) -> Option<UpdateHandle> {
        self.keys().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, UpdateHandle>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
