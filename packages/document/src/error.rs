use thiserror::Error;

/// Structural failures while loading or editing a document
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Path {0} does not resolve to an object or array")]
    NotComposite(String),

    #[error("Path {0} is not an object")]
    NotObject(String),

    #[error("Path {0} is not an array")]
    NotArray(String),

    #[error("Invalid array index {segment:?} in path {path}")]
    InvalidIndex { path: String, segment: String },

    #[error("Index {index} out of range for path {path} (length {len})")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Cannot delete the document root")]
    DeleteRoot,
}

pub type DocumentResult<T> = Result<T, DocumentError>;
