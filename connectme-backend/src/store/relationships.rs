//! Tag hierarchy symmetry and connection-count maintenance.
//!
//! Every function here is idempotent: calling it again with the same inputs
//! leaves the state exactly as the first call did. Retried mutations and the
//! repair pass both rely on that.

use chrono::{DateTime, Utc};
use connectme_types::{Person, Tag, TagSnapshot};
use std::collections::{BTreeSet, HashMap, HashSet};

use super::state::GraphState;

/// One side of a tag's hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Parents,
    Children,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Parents => Side::Children,
            Side::Children => Side::Parents,
        }
    }

    pub fn list(self, tag: &Tag) -> &Vec<TagSnapshot> {
        match self {
            Side::Parents => &tag.parent_tags,
            Side::Children => &tag.child_tags,
        }
    }

    pub fn list_mut(self, tag: &mut Tag) -> &mut Vec<TagSnapshot> {
        match self {
            Side::Parents => &mut tag.parent_tags,
            Side::Children => &mut tag.child_tags,
        }
    }
}

/// Append `snapshot` unless an entry with the same id is already present
pub fn insert_ref(list: &mut Vec<TagSnapshot>, snapshot: TagSnapshot) -> bool {
    if list.iter().any(|t| t.id == snapshot.id) {
        return false;
    }
    list.push(snapshot);
    true
}

pub fn remove_ref(list: &mut Vec<TagSnapshot>, id: &str) -> bool {
    let before = list.len();
    list.retain(|t| t.id != id);
    list.len() != before
}

/// Replace one side of `tag_id`'s hierarchy with `new` and mirror the
/// difference onto every counterpart: an added parent gains `tag_id` as a
/// child, a removed parent loses it, and the same for children.
///
/// Returns the ids of every tag whose hierarchy lists changed.
pub fn set_links(
    state: &mut GraphState,
    tag_id: &str,
    side: Side,
    new: Vec<TagSnapshot>,
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    let mut affected = BTreeSet::new();
    let Some(tag) = state.tag_mut(tag_id) else {
        return affected;
    };

    let old_ids: Vec<String> = side.list(tag).iter().map(|t| t.id.clone()).collect();
    let added: Vec<String> = new
        .iter()
        .filter(|t| !old_ids.contains(&t.id))
        .map(|t| t.id.clone())
        .collect();
    let removed: Vec<String> = old_ids
        .iter()
        .filter(|id| !new.iter().any(|t| &t.id == *id))
        .cloned()
        .collect();

    if side.list(tag) != &new {
        *side.list_mut(tag) = new;
        tag.updated_at = Some(now);
        affected.insert(tag_id.to_string());
    }
    let me = tag.snapshot();

    for other in added {
        if link(state, &other, side.opposite(), me.clone(), now) {
            affected.insert(other);
        }
    }
    for other in removed {
        if unlink(state, &other, side.opposite(), tag_id, now) {
            affected.insert(other);
        }
    }

    affected
}

/// Add `snapshot` to one side of `tag_id`. No-op when already linked.
pub fn link(
    state: &mut GraphState,
    tag_id: &str,
    side: Side,
    snapshot: TagSnapshot,
    now: DateTime<Utc>,
) -> bool {
    match state.tag_mut(tag_id) {
        Some(tag) => {
            let inserted = insert_ref(side.list_mut(tag), snapshot);
            if inserted {
                tag.updated_at = Some(now);
            }
            inserted
        }
        None => false,
    }
}

pub fn unlink(
    state: &mut GraphState,
    tag_id: &str,
    side: Side,
    target: &str,
    now: DateTime<Utc>,
) -> bool {
    match state.tag_mut(tag_id) {
        Some(tag) => {
            let removed = remove_ref(side.list_mut(tag), target);
            if removed {
                tag.updated_at = Some(now);
            }
            removed
        }
        None => false,
    }
}

/// Strip every reference to `tag_id` from other tags' hierarchies and from
/// persons. Returns the tags whose lists changed and whether any person
/// changed.
pub fn detach_tag(
    state: &mut GraphState,
    tag_id: &str,
    now: DateTime<Utc>,
) -> (BTreeSet<String>, bool) {
    let mut affected = BTreeSet::new();
    for tag in state.tags.iter_mut().filter(|t| t.id != tag_id) {
        let from_parents = remove_ref(&mut tag.parent_tags, tag_id);
        let from_children = remove_ref(&mut tag.child_tags, tag_id);
        if from_parents || from_children {
            tag.updated_at = Some(now);
            affected.insert(tag.id.clone());
        }
    }

    let mut persons_changed = false;
    for person in state.persons.iter_mut() {
        if remove_ref(&mut person.tags, tag_id) {
            person.updated_at = Some(now);
            persons_changed = true;
        }
    }

    (affected, persons_changed)
}

/// Rewrite the denormalized name of every snapshot pointing at `tag_id`.
/// Returns `(tags_changed, persons_changed)`.
pub fn rename_snapshots(state: &mut GraphState, tag_id: &str, name: &str) -> (bool, bool) {
    let mut tags_changed = false;
    for tag in state.tags.iter_mut() {
        for snapshot in tag.parent_tags.iter_mut().chain(tag.child_tags.iter_mut()) {
            if snapshot.id == tag_id && snapshot.name != name {
                snapshot.name = name.to_string();
                tags_changed = true;
            }
        }
    }

    let mut persons_changed = false;
    for person in state.persons.iter_mut() {
        for snapshot in person.tags.iter_mut() {
            if snapshot.id == tag_id && snapshot.name != name {
                snapshot.name = name.to_string();
                persons_changed = true;
            }
        }
    }

    (tags_changed, persons_changed)
}

/// Bring every snapshot name in line with the tag it points at. Snapshots of
/// missing tags are left alone. Returns how many snapshots changed and which
/// collections they live in.
pub fn refresh_snapshot_names(state: &mut GraphState) -> (usize, bool, bool) {
    let names: HashMap<String, String> = state
        .tags
        .iter()
        .map(|t| (t.id.clone(), t.name.clone()))
        .collect();

    let mut refreshed = 0;
    let mut tags_changed = false;
    for tag in state.tags.iter_mut() {
        for snapshot in tag.parent_tags.iter_mut().chain(tag.child_tags.iter_mut()) {
            if let Some(name) = names.get(&snapshot.id) {
                if &snapshot.name != name {
                    snapshot.name = name.clone();
                    refreshed += 1;
                    tags_changed = true;
                }
            }
        }
    }

    let mut persons_changed = false;
    for person in state.persons.iter_mut() {
        for snapshot in person.tags.iter_mut() {
            if let Some(name) = names.get(&snapshot.id) {
                if &snapshot.name != name {
                    snapshot.name = name.clone();
                    refreshed += 1;
                    persons_changed = true;
                }
            }
        }
    }

    (refreshed, tags_changed, persons_changed)
}

/// tag id -> ids of persons tagged with it, in collection order
fn person_index(persons: &[Person]) -> HashMap<&str, Vec<&str>> {
    let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
    for person in persons {
        for tag in &person.tags {
            index.entry(tag.id.as_str()).or_default().push(person.id.as_str());
        }
    }
    index
}

fn connections_with(index: &HashMap<&str, Vec<&str>>, tag: &Tag) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    let persons = index.get(tag.id.as_str()).map(|v| v.as_slice()).unwrap_or(&[]);
    let hierarchy = tag
        .parent_tags
        .iter()
        .chain(tag.child_tags.iter())
        .map(|t| t.id.as_str());
    for id in persons.iter().copied().chain(hierarchy) {
        if seen.insert(id) {
            out.push(id.to_string());
        }
    }
    out
}

/// Distinct union of persons referencing `tag`, its parents and its
/// children: persons first (collection order), then parents, then children.
pub fn canonical_connections(state: &GraphState, tag: &Tag) -> Vec<String> {
    connections_with(&person_index(&state.persons), tag)
}

/// Recompute `connections` / `connection_count` for the given tag ids.
/// Unknown ids are ignored. Returns how many tags actually changed.
pub fn recompute_connections<'a, I>(state: &mut GraphState, ids: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted: HashSet<&str> = ids.into_iter().collect();
    if wanted.is_empty() {
        return 0;
    }

    let updates: Vec<(usize, Vec<String>)> = {
        let index = person_index(&state.persons);
        state
            .tags
            .iter()
            .enumerate()
            .filter(|(_, t)| wanted.contains(t.id.as_str()))
            .filter_map(|(pos, t)| {
                let connections = connections_with(&index, t);
                if connections != t.connections || connections.len() != t.connection_count {
                    Some((pos, connections))
                } else {
                    None
                }
            })
            .collect()
    };

    let changed = updates.len();
    for (pos, connections) in updates {
        let tag = &mut state.tags[pos];
        tag.connection_count = connections.len();
        tag.connections = connections;
    }
    changed
}

pub fn recompute_all(state: &mut GraphState) -> usize {
    let ids: Vec<String> = state.tags.iter().map(|t| t.id.clone()).collect();
    recompute_connections(state, ids.iter().map(String::as_str))
}
