//! Single-writer store backed by one JSON file.

use super::{CommitOperation, ConfigStore, UpdateHandle};
use crate::error::{ConfigError, ConfigResult, StoreError};
use crate::fs::write_atomic;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The document lives in a file; lookups read other files by path
///
/// There is no version to compare against and no change notification,
/// so commits always succeed on the first attempt and watches do nothing.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`, which must already exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        std::fs::metadata(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self, key: &str) -> String {
        match tokio::fs::read(key).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key, "file store: no such file");
                String::new()
            }
            Err(err) => {
                warn!(key = %key, error = %err, "file store: read failed");
                String::new()
            }
        }
    }

    async fn watch_to_update(&self, _handle: UpdateHandle, _key: &str) {}

    async fn pull(&self, _handle: &UpdateHandle, snapshot: &mut Snapshot) -> ConfigResult<bool> {
        let bytes = tokio::fs::read(&self.path).await.map_err(StoreError::from)?;
        if bytes.is_empty() {
            return Ok(false);
        }

        let before = snapshot.document.dump();
        snapshot
            .document
            .load(&bytes)
            .map_err(|source| StoreError::Corrupt {
                key: self.path.display().to_string(),
                source,
            })?;
        Ok(snapshot.document.dump() != before)
    }

    async fn commit(
        &self,
        _handle: &UpdateHandle,
        snapshot: &mut Snapshot,
        operation: &mut dyn CommitOperation,
    ) -> ConfigResult<()> {
        operation.apply(snapshot).await?;
        write_atomic(&self.path, snapshot.document.dump())
            .await
            .map_err(|source| ConfigError::Persist {
                path: self.path.clone(),
                source,
            })
    }
}
