use serde::Serialize;

use super::kind::CollectionKind;

/// Change notification broadcast to subscribers. Receivers that lag behind
/// the channel capacity miss events; they should refetch via the version
/// marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Created { kind: CollectionKind, id: String },
    Updated { kind: CollectionKind, id: String },
    Deleted { kind: CollectionKind, id: String },
    Repaired { items_fixed: usize },
    /// A collection reached disk
    Saved { kind: CollectionKind },
    /// A write failed; memory is ahead of disk for `kind`
    PersistenceFailed { kind: CollectionKind, error: String },
}
