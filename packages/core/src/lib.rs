//! # Configurator Core
//!
//! Keeps one JSON configuration document in sync with a shared store and
//! turns it into a deployed artifact.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ store: pull / optimistic commit / watch     │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ config: serialized clone → edit → publish   │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ directives: expand a throwaway copy         │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ pipeline: transform → validate → write →    │
//! │           reload                            │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Clone, mutate, publish**: every pipeline run works on a private
//!    [`Snapshot`]; only a fully rendered one replaces the published state
//! 2. **One run at a time**: `pull`, `update` and `mutate` share a lock
//! 3. **Optimistic commits**: cross-process writers are handled by a
//!    bounded compare-and-set loop in the store, not by the lock
//! 4. **Expanded values never persist**: directives are resolved on a copy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use configurator_core::{Configurator, KvStore, KvStoreSettings, MemoryKv, PipelineSettings};
//! use std::sync::Arc;
//!
//! let store = KvStore::new(Arc::new(MemoryKv::new()), KvStoreSettings::default());
//! let settings = PipelineSettings::new("/etc/haproxy/haproxy.cfg", "render-haproxy")
//!     .with_validate("haproxy -c -f $FILE")
//!     .with_reload("systemctl reload haproxy");
//!
//! let config = Configurator::new(Arc::new(store), settings)?;
//! config.update().await?;
//! config
//!     .mutate(|tree| tree.replace("/backends/0/port", serde_json::json!(8080)))
//!     .await?;
//! ```

mod builtins;
mod config;
mod directives;
mod error;
mod exec;
mod fs;
mod pipeline;
mod settings;
mod snapshot;
pub mod store;

pub use builtins::{builtin_directives, LookupDirective, FILE_DIRECTIVE, VALUE_DIRECTIVE};
pub use config::{Configurator, ConfiguratorBuilder};
pub use directives::{DirectiveEngine, DirectiveHandler, DirectiveTable, FnDirective};
pub use error::{ConfigError, ConfigResult, StoreError};
pub use exec::{CommandOutput, CommandRunner, ExecError, Invocation, ShellRunner, Stage};
pub use pipeline::RenderPipeline;
pub use settings::{PipelineSettings, DEFAULT_COMMAND_TIMEOUT_SECS};
pub use snapshot::Snapshot;
pub use store::{
    CommitOperation, ConfigStore, FileStore, KvBackend, KvPair, KvStore, KvStoreSettings,
    MemoryKv, UpdateHandle, UpdateTrigger, WatchRegistry, DEFAULT_COMMIT_ATTEMPTS,
};

// Re-export the document model for convenience
pub use configurator_document::{DocumentError, JsonTree, Map, Path, Value};
