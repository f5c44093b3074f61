//! # JSON Tree
//!
//! The authoritative configuration document.
//!
//! Every node is a [`Value`]: an object, an array, or a scalar. Path
//! resolution matches exhaustively on the variant at each step, so
//! "absent" and "wrong type" are ordinary results rather than panics.
//!
//! ## Canonical encoding
//!
//! [`JsonTree::dump`] pretty-prints with two-space indentation and object
//! keys in sorted order. Two trees are structurally equal exactly when
//! their dumps are byte-equal, which is what the store relies on to spot
//! no-op pulls.

use crate::error::{DocumentError, DocumentResult};
use crate::path::Path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonTree {
    root: Value,
}

impl Default for JsonTree {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonTree {
    /// Create an empty document (`{}`)
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_slice(bytes: &[u8]) -> DocumentResult<Self> {
        Ok(Self {
            root: serde_json::from_slice(bytes)?,
        })
    }

    /// Replace the whole document with parsed `bytes`
    ///
    /// The tree is left unchanged if `bytes` is not valid JSON.
    pub fn load(&mut self, bytes: &[u8]) -> DocumentResult<()> {
        self.root = serde_json::from_slice(bytes)?;
        Ok(())
    }

    /// Canonical encoding of the document
    pub fn dump(&self) -> Vec<u8> {
        format!("{:#}", self.root).into_bytes()
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    /// Look up the node at `path`
    ///
    /// `None` means absent, which is distinct from `Some(Value::Null)`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.resolve(&Path::parse(path))
    }

    /// Like [`get`](Self::get), but scalars (and absence) come back wrapped
    /// in a one-element array
    pub fn get_wrapped(&self, path: &str) -> Value {
        match self.get(path) {
            Some(node @ (Value::Object(_) | Value::Array(_))) => node.clone(),
            Some(node) => Value::Array(vec![node.clone()]),
            None => Value::Array(vec![Value::Null]),
        }
    }

    pub fn is_object(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Object(_)))
    }

    pub fn is_array(&self, path: &str) -> bool {
        matches!(self.get(path), Some(Value::Array(_)))
    }

    pub fn is_composite(&self, path: &str) -> bool {
        self.is_object(path) || self.is_array(path)
    }

    /// Overwrite the node at `path`
    ///
    /// An empty path replaces the root. Otherwise the parent must already be
    /// an object (the key is created if missing) or an array (the index may
    /// be an existing position or exactly one past the end).
    pub fn replace(&mut self, path: &str, value: Value) -> DocumentResult<()> {
        let path = Path::parse(path);
        let Some((parent, key)) = path.split_last() else {
            self.root = value;
            return Ok(());
        };

        let node = self
            .resolve_mut(&parent)
            .ok_or_else(|| DocumentError::NotComposite(parent.to_string()))?;

        match node {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                let index = parse_index(&path, key)?;
                if index < items.len() {
                    items[index] = value;
                } else if index == items.len() {
                    items.push(value);
                } else {
                    return Err(DocumentError::IndexOutOfRange {
                        path: path.to_string(),
                        index,
                        len: items.len(),
                    });
                }
                Ok(())
            }
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Err(DocumentError::NotComposite(parent.to_string()))
            }
        }
    }

    /// Shallow-merge `entries` into the object at `path`, overwriting on
    /// key collision
    pub fn merge(&mut self, path: &str, entries: Map<String, Value>) -> DocumentResult<()> {
        let path = Path::parse(path);
        match self.resolve_mut(&path) {
            Some(Value::Object(map)) => {
                map.extend(entries);
                Ok(())
            }
            _ => Err(DocumentError::NotObject(path.to_string())),
        }
    }

    /// Push `value` onto the end of the array at `path`
    pub fn append(&mut self, path: &str, value: Value) -> DocumentResult<()> {
        let path = Path::parse(path);
        match self.resolve_mut(&path) {
            Some(Value::Array(items)) => {
                items.push(value);
                Ok(())
            }
            _ => Err(DocumentError::NotArray(path.to_string())),
        }
    }

    /// Remove the member or index at `path` from its parent
    ///
    /// Removing a missing object key succeeds. Array removal keeps the order
    /// of the remaining items.
    pub fn delete(&mut self, path: &str) -> DocumentResult<()> {
        let path = Path::parse(path);
        let Some((parent, key)) = path.split_last() else {
            return Err(DocumentError::DeleteRoot);
        };

        match self.resolve_mut(&parent) {
            Some(Value::Object(map)) => {
                map.remove(key);
                Ok(())
            }
            Some(Value::Array(items)) => {
                let index = parse_index(&path, key)?;
                if index >= items.len() {
                    return Err(DocumentError::IndexOutOfRange {
                        path: path.to_string(),
                        index,
                        len: items.len(),
                    });
                }
                items.remove(index);
                Ok(())
            }
            _ => Err(DocumentError::NotComposite(parent.to_string())),
        }
    }

    /// Every path in the document, parents before children, starting with `/`
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_paths(&self.root, Path::root(), &mut paths);
        paths
    }

    fn resolve(&self, path: &Path) -> Option<&Value> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, segment| child(node, segment))
    }

    fn resolve_mut(&mut self, path: &Path) -> Option<&mut Value> {
        path.segments()
            .iter()
            .try_fold(&mut self.root, |node, segment| child_mut(node, segment))
    }
}

fn child<'a>(node: &'a Value, segment: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => None,
    }
}

fn parse_index(path: &Path, segment: &str) -> DocumentResult<usize> {
    segment
        .parse::<usize>()
        .map_err(|_| DocumentError::InvalidIndex {
            path: path.to_string(),
            segment: segment.to_string(),
        })
}

fn collect_paths(node: &Value, path: Path, paths: &mut Vec<String>) {
    paths.push(path.to_string());
    match node {
        Value::Object(map) => {
            // An empty key has no path of its own
            for (key, value) in map.iter().filter(|(key, _)| !key.is_empty()) {
                collect_paths(value, path.join(key.as_str()), paths);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                collect_paths(value, path.join(index.to_string()), paths);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

impl fmt::Display for JsonTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.root)
    }
}

impl FromStr for JsonTree {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(s.as_bytes())
    }
}

impl From<Value> for JsonTree {
    fn from(root: Value) -> Self {
        Self::from_value(root)
    }
}
