//! In-process key/value backend.
//!
//! Mirrors how Consul versions keys: one global index bumped by every
//! write, with each key remembering the index of its last write.

use super::kv::{KvBackend, KvPair};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, KvPair>,
    index: u64,
}

#[derive(Debug)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
    /// Carries the global index after each write to wake long-polls
    changes: watch::Sender<u64>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
        }
    }

    /// Write unconditionally, returning the new modify index
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> u64 {
        let mut state = self.state();
        let index = Self::write(&mut state, key, value.into());
        drop(state);
        self.changes.send_replace(index);
        index
    }

    /// Remove `key`, returning the new global index
    pub fn delete(&self, key: &str) -> u64 {
        let mut state = self.state();
        state.entries.remove(key);
        state.index += 1;
        let index = state.index;
        drop(state);
        self.changes.send_replace(index);
        index
    }

    /// Current global index
    pub fn index(&self) -> u64 {
        self.state().index
    }

    fn entry(&self, key: &str) -> Option<KvPair> {
        self.state().entries.get(key).cloned()
    }

    fn write(state: &mut MemoryState, key: &str, value: Vec<u8>) -> u64 {
        state.index += 1;
        let modify_index = state.index;
        state.entries.insert(
            key.to_string(),
            KvPair {
                value,
                modify_index,
            },
        );
        modify_index
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        Ok(self.entry(key))
    }

    async fn cas(&self, key: &str, value: Vec<u8>, index: u64) -> Result<bool, StoreError> {
        let mut state = self.state();
        let current = state.entries.get(key).map(|pair| pair.modify_index);
        let matches = match current {
            None => index == 0,
            Some(modify_index) => modify_index == index,
        };
        if !matches {
            return Ok(false);
        }

        let new_index = Self::write(&mut state, key, value);
        drop(state);
        self.changes.send_replace(new_index);
        Ok(true)
    }

    async fn watch_get(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<Option<KvPair>, StoreError> {
        let deadline = Instant::now() + wait;
        // Subscribe before the first check so no write slips between them
        let mut changes = self.changes.subscribe();

        loop {
            let current = self.entry(key);
            if matches!(&current, Some(pair) if pair.modify_index > index) {
                return Ok(current);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(self.entry(key)),
            }
        }
    }
}
