//! # Configurator Server
//!
//! Wires a [`Configurator`](configurator_core::Configurator) to a store
//! chosen by URI and exposes it over HTTP.

pub mod api;
pub mod settings;

pub use api::{router, ApiError};
pub use settings::{open_store, Cli, ServerSettings, StoreUri, StoreUriError, DEFAULT_SETTINGS_NAME};
