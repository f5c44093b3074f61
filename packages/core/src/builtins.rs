//! Lookup directives that read values from the config store.
//!
//! ```text
//! {"$value": "/upstream/host", "default": "127.0.0.1"}
//! ```
//!
//! Looking a key up also asks the store to watch it, so a later change to
//! the key schedules a re-render.

use crate::directives::{DirectiveHandler, DirectiveTable};
use crate::store::{ConfigStore, UpdateHandle};
use async_trait::async_trait;
use configurator_document::{Map, Value};
use std::sync::Arc;
use tracing::warn;

pub const VALUE_DIRECTIVE: &str = "$value";
pub const FILE_DIRECTIVE: &str = "$file";

/// Replaces an invocation with the store value under its key
pub struct LookupDirective {
    name: String,
    store: Arc<dyn ConfigStore>,
    handle: UpdateHandle,
}

impl LookupDirective {
    pub fn new(name: impl Into<String>, store: Arc<dyn ConfigStore>, handle: UpdateHandle) -> Self {
        Self {
            name: name.into(),
            store,
            handle,
        }
    }

    fn watch(&self, key: &str) {
        let store = Arc::clone(&self.store);
        let handle = self.handle.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            store.watch_to_update(handle, &key).await;
        });
    }
}

#[async_trait]
impl DirectiveHandler for LookupDirective {
    async fn expand(&self, invocation: &Map<String, Value>) -> Value {
        let key = match invocation.get(&self.name) {
            Some(Value::String(key)) => key,
            other => {
                warn!(directive = %self.name, argument = ?other, "lookup key is not a string");
                return fallback(invocation);
            }
        };

        self.watch(key);

        let value = self.store.get(key).await;
        if value.is_empty() {
            fallback(invocation)
        } else {
            Value::String(value)
        }
    }
}

fn fallback(invocation: &Map<String, Value>) -> Value {
    match invocation.get("default") {
        Some(Value::Null) | None => Value::String(String::new()),
        Some(default) => default.clone(),
    }
}

/// `$value` and `$file`, both reading through `store`
pub fn builtin_directives(store: Arc<dyn ConfigStore>, handle: UpdateHandle) -> DirectiveTable {
    let mut table = DirectiveTable::new();
    for name in [VALUE_DIRECTIVE, FILE_DIRECTIVE] {
        table.register(
            name,
            LookupDirective::new(name, Arc::clone(&store), handle.clone()),
        );
    }
    table
}
