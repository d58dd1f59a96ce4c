//! Shared types for the contact graph store and the API layer in front of it.
//!
//! Everything here is plain serde data. Field names follow the on-disk JSON
//! format (`_id`, snake_case timestamps) so the same structs serve both the
//! persisted collections and request/response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Color given to tags created without one
pub const DEFAULT_TAG_COLOR: &str = "#6B7280";

fn default_color() -> String {
    DEFAULT_TAG_COLOR.to_string()
}

/// Treat an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Older cleanup scripts wrote a bare number into `connections`.
/// Anything that is not a list of strings is dropped; the list is a cache
/// and gets recomputed on load.
fn lenient_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

// =====================================================
// Tag references
// =====================================================

/// A reference to a tag as accepted at the boundary: either a bare id string
/// or an `{_id, name}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagRef {
    ById(String),
    Snapshot {
        #[serde(rename = "_id", alias = "id")]
        id: String,
        #[serde(default, deserialize_with = "null_as_default")]
        name: String,
    },
}

impl TagRef {
    pub fn id(&self) -> &str {
        match self {
            TagRef::ById(id) => id,
            TagRef::Snapshot { id, .. } => id,
        }
    }

    /// The denormalized name carried by the reference, if any
    pub fn name(&self) -> Option<&str> {
        match self {
            TagRef::Snapshot { name, .. } if !name.is_empty() => Some(name),
            _ => None,
        }
    }
}

impl From<&str> for TagRef {
    fn from(id: &str) -> Self {
        TagRef::ById(id.to_string())
    }
}

impl From<TagSnapshot> for TagRef {
    fn from(snapshot: TagSnapshot) -> Self {
        TagRef::Snapshot {
            id: snapshot.id,
            name: snapshot.name,
        }
    }
}

/// Canonical stored form of a tag reference. Always serialized as
/// `{_id, name}`; deserializes from either [`TagRef`] shape, in which case a
/// bare id yields an empty name until the store fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "TagRef")]
pub struct TagSnapshot {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

impl TagSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl From<TagRef> for TagSnapshot {
    fn from(r: TagRef) -> Self {
        match r {
            TagRef::ById(id) => Self {
                id,
                name: String::new(),
            },
            TagRef::Snapshot { id, name } => Self { id, name },
        }
    }
}

// =====================================================
// Stored entities
// =====================================================

/// A contact in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub phone: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub wechat: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    /// Opaque avatar reference (URL or data URI)
    #[serde(default, deserialize_with = "null_as_default")]
    pub avatar: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<TagSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// camelCase timestamps written by older clients, sometimes next to the
    /// snake_case ones. Read on load, never written.
    #[serde(default, rename = "createdAt", skip_serializing)]
    pub legacy_created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updatedAt", skip_serializing)]
    pub legacy_updated_at: Option<DateTime<Utc>>,
    /// Pre-rename spelling of `description`. Read on load, never written.
    #[serde(default, rename = "profile", skip_serializing)]
    pub legacy_profile: Option<String>,
    /// Fields this version does not know about, kept so a save loses nothing
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Person {
    pub fn has_tag(&self, tag_id: &str) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }
}

/// A tag; tags form a parent/child hierarchy and are attached to persons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parent_tags: Vec<TagSnapshot>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub child_tags: Vec<TagSnapshot>,
    /// Distinct ids counted in `connection_count` (cache)
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub connections: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "createdAt", skip_serializing)]
    pub legacy_created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updatedAt", skip_serializing)]
    pub legacy_updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Tag {
    pub fn snapshot(&self) -> TagSnapshot {
        TagSnapshot::new(self.id.clone(), self.name.clone())
    }

    pub fn has_parent(&self, id: &str) -> bool {
        self.parent_tags.iter().any(|t| t.id == id)
    }

    pub fn has_child(&self, id: &str) -> bool {
        self.child_tags.iter().any(|t| t.id == id)
    }
}

// =====================================================
// Request payloads
// =====================================================

/// Payload for creating a person
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPerson {
    /// Caller-chosen id; generated when absent
    #[serde(default, rename = "_id", alias = "id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub phone: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub wechat: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub avatar: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<TagRef>,
}

impl NewPerson {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = TagRef>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }
}

/// Payload for creating a tag. Cached `connections`/`connection_count` sent
/// by clients are ignored; the store owns them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTag {
    #[serde(default, rename = "_id", alias = "id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parent_tags: Vec<TagRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub child_tags: Vec<TagRef>,
}

impl NewTag {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parents(mut self, parents: impl IntoIterator<Item = TagRef>) -> Self {
        self.parent_tags = parents.into_iter().collect();
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = TagRef>) -> Self {
        self.child_tags = children.into_iter().collect();
        self
    }
}

/// Partial update for a person. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wechat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<TagRef>>,
}

/// Partial update for a tag. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tags: Option<Vec<TagRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_tags: Option<Vec<TagRef>>,
}

// =====================================================
// Response types
// =====================================================

/// Dataset version marker. A cached copy is current only when both fields
/// equal what the cache last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Monotonic marker (milliseconds since the Unix epoch, bumped by at least 1)
    pub version: i64,
    /// ISO-8601 time of the last mutation
    pub last_modified: String,
}

impl VersionInfo {
    /// Whether a client holding `cached` must refetch
    pub fn is_stale(&self, cached: &VersionInfo) -> bool {
        self != cached
    }
}

/// Both collections read together with the version they were read at, for
/// clients that cache the whole dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub persons: Vec<Person>,
    pub tags: Vec<Tag>,
    /// Serialized inline as `version` and `lastModified`
    #[serde(flatten)]
    pub version: VersionInfo,
}

/// Summary of a consistency repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub items_fixed: usize,
    pub details: Vec<String>,
    pub orphans_fixed: usize,
    pub duplicates_merged: usize,
    pub links_repaired: usize,
    pub counts_corrected: usize,
    pub snapshots_refreshed: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.items_fixed == 0
    }
}

/// Store-level counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub persons: usize,
    pub tags: usize,
    /// Collections waiting on their debounce timer
    pub pending_writes: Vec<String>,
    /// Collections whose last write failed (memory ahead of disk)
    pub diverged: Vec<String>,
    pub version: VersionInfo,
}
