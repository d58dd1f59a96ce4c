//! Error taxonomy for the store.
//!
//! Validation and not-found errors are raised before anything is applied.
//! Persistence errors are raised after the in-memory mutation is already
//! visible; callers must not assume a rollback happened.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::store::CollectionKind;

/// Input rejected before any state changed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("a tag named \"{name}\" already exists")]
    DuplicateName { name: String },

    #[error("id already in use: {id}")]
    DuplicateId { id: String },

    #[error("unknown tag: {id}")]
    UnknownTag { id: String },

    #[error("tag {id} cannot reference itself")]
    SelfReference { id: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Disk write or read failure for a collection file
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize collection: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{path} is not a valid collection file: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {path} (previous file restored: {restored}): {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
        restored: bool,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: CollectionKind, id: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl StoreError {
    pub(crate) fn not_found(kind: CollectionKind, id: &str) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
