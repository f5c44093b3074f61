//! Error types for the store and the orchestrator

use crate::exec::ExecError;
use configurator_document::DocumentError;
use std::path::PathBuf;
use thiserror::Error;

/// Transport or data failures reported by a backing store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON from config store at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: DocumentError,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Everything a pull, update or mutate can fail with
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid document: {0}")]
    Structural(#[from] DocumentError),

    #[error("Mutation failed: {0}")]
    MutationRejected(#[source] DocumentError),

    #[error("Unable to commit after {attempts} attempts")]
    StoreConflict { attempts: usize },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to write {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings: {0}")]
    Settings(String),
}

impl ConfigError {
    /// The failed external command, if that is what went wrong
    pub fn exec(&self) -> Option<&ExecError> {
        match self {
            ConfigError::Exec(err) => Some(err),
            _ => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
