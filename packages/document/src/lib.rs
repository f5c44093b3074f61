//! # Configurator Document
//!
//! The configuration document held by the orchestrator: a tree of JSON
//! values addressed by slash-separated paths.
//!
//! ```text
//! {"void": {"json": 3}, "array": [1, 3]}
//!
//! /            → the whole document
//! /void/json   → 3
//! /array/1     → 3
//! /array/9     → absent
//! ```
//!
//! Reads never fail: a path that runs through a scalar or past the end of
//! an array is simply absent. Writes report a [`DocumentError`] and leave
//! the tree untouched.

pub mod error;
pub mod path;
pub mod tree;

pub use error::{DocumentError, DocumentResult};
pub use path::Path;
pub use tree::JsonTree;

// Re-export the value types callers build edits from
pub use serde_json::{Map, Value};
