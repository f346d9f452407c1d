//! Error taxonomy surfaced to collaborators of the memory substrate.
//!
//! One enum, one `Result` alias. Storage errors propagate; overlay errors
//! are absorbed by callers that choose to (see `manager::write_path`) and
//! never appear here as a distinct "soft" variant — they're just `Result`s
//! that the fan-out step chooses not to bubble up.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SubstrateError>;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl From<std::io::Error> for SubstrateError {
    fn from(err: std::io::Error) -> Self {
        SubstrateError::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SubstrateError {
    fn from(err: serde_json::Error) -> Self {
        SubstrateError::StorageFailure(format!("serialization error: {err}"))
    }
}

impl From<redb::DatabaseError> for SubstrateError {
    fn from(err: redb::DatabaseError) -> Self {
        SubstrateError::StorageFailure(format!("index database error: {err}"))
    }
}

impl From<redb::TransactionError> for SubstrateError {
    fn from(err: redb::TransactionError) -> Self {
        SubstrateError::StorageFailure(format!("index transaction error: {err}"))
    }
}

impl From<redb::TableError> for SubstrateError {
    fn from(err: redb::TableError) -> Self {
        SubstrateError::StorageFailure(format!("index table error: {err}"))
    }
}

impl From<redb::CommitError> for SubstrateError {
    fn from(err: redb::CommitError) -> Self {
        SubstrateError::StorageFailure(format!("index commit error: {err}"))
    }
}

impl From<redb::StorageError> for SubstrateError {
    fn from(err: redb::StorageError) -> Self {
        SubstrateError::StorageFailure(format!("index storage error: {err}"))
    }
}

impl SubstrateError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        SubstrateError::BadInput(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            SubstrateError::BadInput(_) => "BadInput",
            SubstrateError::NotFound(_) => "NotFound",
            SubstrateError::AccessDenied(_) => "AccessDenied",
            SubstrateError::Duplicate(_) => "Duplicate",
            SubstrateError::InvalidState(_) => "InvalidState",
            SubstrateError::StorageFailure(_) => "StorageFailure",
            SubstrateError::ResourceLimit(_) => "ResourceLimit",
            SubstrateError::NotImplemented(_) => "NotImplemented",
        }
    }
}
