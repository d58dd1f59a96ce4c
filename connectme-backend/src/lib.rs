//! JSON-file-backed store for the ConnectMe contact graph: persons, tags and
//! the tag hierarchy, kept consistent in memory and saved to disk in
//! debounced batches.

pub mod config;
pub mod error;
pub mod persistence;
pub mod store;

pub use config::StoreConfig;
pub use error::{PersistenceError, StoreError, StoreResult, ValidationError};
pub use store::{CollectionKind, Entity, GraphStore, InvariantViolation, StoreEvent};
