//! Durable storage of the collections as JSON files.
//!
//! The scheduler only sees two seams: a [`SnapshotSource`] that serializes
//! the current in-memory collection and a [`CollectionSink`] that stores the
//! bytes. Production wires the store's state and [`JsonFileSink`]; tests plug
//! in counting or failing sinks.

pub mod file_ops;
pub mod scheduler;

use std::path::PathBuf;

use crate::error::PersistenceError;
use crate::store::CollectionKind;

pub use scheduler::{PersistenceScheduler, PersistenceStatus};

/// Produces the full serialized form of one collection
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self, kind: CollectionKind) -> Result<Vec<u8>, PersistenceError>;
}

/// Stores the serialized form of one collection
pub trait CollectionSink: Send + Sync {
    fn write(&self, kind: CollectionKind, bytes: &[u8]) -> Result<(), PersistenceError>;
}

/// One pretty-printed JSON array per collection under `data_dir`
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    data_dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path(&self, kind: CollectionKind) -> PathBuf {
        self.data_dir.join(kind.file_name())
    }
}

impl CollectionSink for JsonFileSink {
    fn write(&self, kind: CollectionKind, bytes: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path(kind);
        file_ops::write_with_backup(&path, |p| file_ops::write_file(p, bytes))
    }
}
