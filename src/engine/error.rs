use crate::store::StoreError;

/// Failure categories surfaced to the edge. Authorization-shaped checks
/// (owner booking own item, non-owner deciding, non-participant viewing)
/// are reported as `NotFound`.
#[derive(Debug)]
pub enum EngineError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Storage(String),
}

impl EngineError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub(crate) fn bad_request(what: impl Into<String>) -> Self {
        EngineError::BadRequest(what.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(msg) => write!(f, "not found: {msg}"),
            EngineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(_) => EngineError::Storage(e.to_string()),
            StoreError::DuplicateEmail(_) => EngineError::Conflict(e.to_string()),
            StoreError::Missing(_) => EngineError::NotFound(e.to_string()),
            StoreError::StaleWrite(_) => EngineError::BadRequest(e.to_string()),
        }
    }
}
