//! # Directive Engine
//!
//! Replaces directive objects with computed values before rendering.
//!
//! A directive is any object that has a member named after a registered
//! handler. The whole object (the name key plus sibling arguments such as
//! `default`) is handed to the handler and replaced by its return value:
//!
//! ```text
//! {"x": {"$value": "/one", "default": "nope"}}   → {"x": "1"}
//! ```
//!
//! ## Semantics
//!
//! - Expansion works on a copy; the input tree is never modified
//! - Handlers see the invocation as it appears in the input, and their
//!   results are not expanded again
//! - A directive nested inside another directive's arguments is dropped
//!   along with its parent
//! - Matching is by member name alone, so a plain data key that happens to
//!   equal a directive name turns its parent object into an invocation
//! - Objects stored under an empty key have no path and are left alone

use async_trait::async_trait;
use configurator_document::{JsonTree, Map, Path, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Computes the replacement value for one directive invocation
#[async_trait]
pub trait DirectiveHandler: Send + Sync {
    async fn expand(&self, invocation: &Map<String, Value>) -> Value;
}

/// Adapts a plain function into a [`DirectiveHandler`]
pub struct FnDirective<F>(pub F);

#[async_trait]
impl<F> DirectiveHandler for FnDirective<F>
where
    F: Fn(&Map<String, Value>) -> Value + Send + Sync,
{
    async fn expand(&self, invocation: &Map<String, Value>) -> Value {
        (self.0)(invocation)
    }
}

/// Directive name → handler
///
/// Built once at startup and handed to the [`DirectiveEngine`]. Registering
/// a name twice keeps the later handler.
#[derive(Clone, Default)]
pub struct DirectiveTable {
    handlers: HashMap<String, Arc<dyn DirectiveHandler>>,
}

impl DirectiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl DirectiveHandler + 'static,
    ) -> &mut Self {
        self.register_shared(name, Arc::new(handler))
    }

    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn DirectiveHandler>,
    ) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> Value + Send + Sync + 'static,
    {
        self.register(name, FnDirective(f))
    }

    /// Register every handler from `other`, overriding existing names
    pub fn extend(&mut self, other: DirectiveTable) {
        self.handlers.extend(other.handlers);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DirectiveHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for DirectiveTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("DirectiveTable").field("names", &names).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectiveEngine {
    table: DirectiveTable,
}

impl DirectiveEngine {
    pub fn new(table: DirectiveTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &DirectiveTable {
        &self.table
    }

    /// Paths of directive objects in `tree`, paired with the directive name
    pub fn directive_paths(&self, tree: &JsonTree) -> Vec<(String, String)> {
        tree.paths()
            .iter()
            .filter_map(|raw| {
                let path = Path::parse(raw);
                let (parent, name) = path.split_last()?;
                if !self.table.contains(name) {
                    return None;
                }
                let parent = parent.to_string();
                tree.is_object(&parent).then(|| (parent, name.to_string()))
            })
            .collect()
    }

    /// Expand every directive in a copy of `tree`
    pub async fn process(&self, tree: &JsonTree) -> JsonTree {
        let mut expanded = tree.clone();

        for (path, name) in self.directive_paths(tree) {
            // Already replaced as part of an enclosing directive
            if !expanded.is_object(&path) {
                debug!(path = %path, directive = %name, "skipping nested directive");
                continue;
            }
            let (Some(handler), Some(Value::Object(invocation))) =
                (self.table.get(&name), tree.get(&path))
            else {
                continue;
            };

            let value = handler.expand(invocation).await;
            debug!(path = %path, directive = %name, "expanded directive");
            if let Err(err) = expanded.replace(&path, value) {
                debug!(path = %path, error = %err, "directive target vanished");
            }
        }

        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup_table() -> DirectiveTable {
        let mut table = DirectiveTable::new();
        table.register_fn("$value", |invocation| {
            let value = match invocation.get("$value").and_then(Value::as_str) {
                Some("/one") => "1",
                Some("/two") => "2",
                _ => "",
            };
            if !value.is_empty() {
                return json!(value);
            }
            invocation.get("default").cloned().unwrap_or(json!(""))
        });
        table
    }

    #[tokio::test]
    async fn test_expands_with_and_without_default() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({
            "tree": 3,
            "other_thing": [1, 3, 2],
            "preprocess_this": {"$value": "/one", "default": "nope"},
            "and_this": {"$value": "/two"},
            "missing_with_default": {"$value": "/absent", "default": "nope"},
            "missing": {"$value": "/absent"}
        }));

        let result = engine.process(&tree).await;
        assert_eq!(result.get("/preprocess_this"), Some(&json!("1")));
        assert_eq!(result.get("/and_this"), Some(&json!("2")));
        assert_eq!(result.get("/missing_with_default"), Some(&json!("nope")));
        assert_eq!(result.get("/missing"), Some(&json!("")));
        assert_eq!(result.get("/other_thing"), Some(&json!([1, 3, 2])));
    }

    #[tokio::test]
    async fn test_input_is_not_modified() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({"x": {"$value": "/one"}}));
        let before = tree.clone();

        engine.process(&tree).await;
        assert_eq!(tree, before);
    }

    #[tokio::test]
    async fn test_directives_inside_arrays() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({"servers": [{"$value": "/one"}, {"$value": "/two"}]}));
        let result = engine.process(&tree).await;
        assert_eq!(result.get("/servers"), Some(&json!(["1", "2"])));
    }

    #[tokio::test]
    async fn test_root_directive() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({"$value": "/one"}));
        assert_eq!(engine.process(&tree).await.root(), &json!("1"));
    }

    #[tokio::test]
    async fn test_expansion_is_idempotent() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({"x": {"$value": "/one"}, "y": [{"$value": "/two"}]}));
        let once = engine.process(&tree).await;
        let twice = engine.process(&once).await;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_results_are_not_expanded_again() {
        let mut table = DirectiveTable::new();
        table.register_fn("$wrap", |_| json!({"$wrap": "again"}));
        let engine = DirectiveEngine::new(table);

        let tree = JsonTree::from_value(json!({"x": {"$wrap": true}}));
        let result = engine.process(&tree).await;
        assert_eq!(result.get("/x"), Some(&json!({"$wrap": "again"})));
    }

    #[tokio::test]
    async fn test_nested_directive_goes_with_parent() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({
            "x": {"$value": "/one", "default": {"$value": "/two"}}
        }));
        let result = engine.process(&tree).await;
        assert_eq!(result.get("/x"), Some(&json!("1")));
    }

    #[tokio::test]
    async fn test_handler_sees_whole_invocation() {
        let mut table = DirectiveTable::new();
        table.register_fn("$echo", |invocation| Value::Object(invocation.clone()));
        let engine = DirectiveEngine::new(table);

        let tree = JsonTree::from_value(json!({"x": {"$echo": "a", "extra": 1}}));
        let result = engine.process(&tree).await;
        assert_eq!(result.get("/x"), Some(&json!({"$echo": "a", "extra": 1})));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut table = DirectiveTable::new();
        table.register_fn("$v", |_| json!("first"));
        table.register_fn("$v", |_| json!("second"));
        assert_eq!(table.len(), 1);

        let engine = DirectiveEngine::new(table);
        let tree = JsonTree::from_value(json!({"x": {"$v": null}}));
        assert_eq!(engine.process(&tree).await.get("/x"), Some(&json!("second")));
    }

    #[test]
    fn test_directive_paths() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({
            "a": {"$value": "/one"},
            "b": {"c": [{"$value": "/two"}]},
            "plain": {"value": 1}
        }));
        assert_eq!(
            engine.directive_paths(&tree),
            vec![
                ("/a".to_string(), "$value".to_string()),
                ("/b/c/0".to_string(), "$value".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_data_key_named_like_directive_expands_parent() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({
            "meta": {"$value": "literal text", "note": 1},
            "kept": {"value": "literal text"}
        }));

        // Only the name matters, so the whole data object is replaced
        let result = engine.process(&tree).await;
        assert_eq!(result.get("/meta"), Some(&json!("")));
        assert_eq!(result.get("/kept"), Some(&json!({"value": "literal text"})));
    }

    #[tokio::test]
    async fn test_directive_under_key_with_slash() {
        let engine = DirectiveEngine::new(lookup_table());
        let tree = JsonTree::from_value(json!({
            "/etc/hosts": {"$value": "/one"},
            "files": {"a/b": [{"$value": "/two"}]}
        }));

        assert_eq!(
            engine.directive_paths(&tree),
            vec![
                ("/~1etc~1hosts".to_string(), "$value".to_string()),
                ("/files/a~1b/0".to_string(), "$value".to_string()),
            ]
        );
        assert_eq!(
            engine.process(&tree).await.root(),
            &json!({"/etc/hosts": "1", "files": {"a/b": ["2"]}})
        );
    }
}
