//! Consistency repair: heals drift that older releases left in the data
//! files. Steps run in a fixed order and each one only ever moves the state
//! closer to the invariants, so a second pass over repaired data is a no-op.
//!
//! 1. reference lists: drop repeated ids and self references
//! 2. orphans: person references to missing tags are re-pointed by name or
//!    backed by a placeholder tag; hierarchy references to missing tags are
//!    dropped
//! 3. duplicate names: merged into the best-connected tag
//! 4. hierarchy symmetry, then connection counts
//! 5. snapshot names

use chrono::{DateTime, Utc};
use connectme_types::{DEFAULT_TAG_COLOR, RepairReport, Tag, TagSnapshot};
use serde_json::Map;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use super::kind::Touched;
use super::relationships::{self, Side, canonical_connections, insert_ref};
use super::state::{GraphState, name_key};

#[derive(Default)]
struct Pass {
    report: RepairReport,
    touched: Touched,
}

impl Pass {
    fn note(&mut self, detail: String) {
        log::debug!("[REPAIR] {}", detail);
        self.report.details.push(detail);
    }
}

/// Run every repair step over `state`. Returns the report and which
/// collections were modified.
pub fn repair(state: &mut GraphState, now: DateTime<Utc>) -> (RepairReport, Touched) {
    let mut pass = Pass::default();

    clean_reference_lists(state, &mut pass);
    fix_orphans(state, now, &mut pass);
    merge_duplicates(state, &mut pass);
    repair_links(state, &mut pass);

    let corrected = relationships::recompute_all(state);
    if corrected > 0 {
        pass.report.counts_corrected = corrected;
        pass.touched.tags = true;
        pass.note(format!("Recomputed connection counts for {} tag(s)", corrected));
    }

    let (refreshed, tags_changed, persons_changed) = relationships::refresh_snapshot_names(state);
    if refreshed > 0 {
        pass.report.snapshots_refreshed = refreshed;
        pass.touched.tags |= tags_changed;
        pass.touched.persons |= persons_changed;
        pass.note(format!("Refreshed {} stale tag name snapshot(s)", refreshed));
    }

    let report = &mut pass.report;
    report.items_fixed = report.orphans_fixed
        + report.duplicates_merged
        + report.links_repaired
        + report.counts_corrected
        + report.snapshots_refreshed;
    (pass.report, pass.touched)
}

/// Drop empty ids, repeated ids (first occurrence wins) and, when `owner`
/// is given, references to the owner itself.
fn clean_list(list: &mut Vec<TagSnapshot>, owner: Option<&str>) -> usize {
    let before = list.len();
    let mut seen: HashSet<String> = HashSet::new();
    list.retain(|t| !t.id.is_empty() && Some(t.id.as_str()) != owner && seen.insert(t.id.clone()));
    before - list.len()
}

fn clean_reference_lists(state: &mut GraphState, pass: &mut Pass) {
    for person in state.persons.iter_mut() {
        let removed = clean_list(&mut person.tags, None);
        if removed > 0 {
            pass.report.links_repaired += removed;
            pass.touched.persons = true;
            pass.note(format!(
                "Removed {} repeated tag reference(s) from person {}",
                removed, person.id
            ));
        }
    }

    for tag in state.tags.iter_mut() {
        let removed = clean_list(&mut tag.parent_tags, Some(tag.id.as_str()))
            + clean_list(&mut tag.child_tags, Some(tag.id.as_str()));
        if removed > 0 {
            pass.report.links_repaired += removed;
            pass.touched.tags = true;
            pass.note(format!(
                "Removed {} repeated or self reference(s) from tag {}",
                removed, tag.id
            ));
        }
    }
}

fn placeholder(id: &str, name: &str, now: DateTime<Utc>) -> Tag {
    Tag {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("Auto-generated placeholder for missing tag {}", id),
        color: DEFAULT_TAG_COLOR.to_string(),
        parent_tags: Vec::new(),
        child_tags: Vec::new(),
        connections: Vec::new(),
        connection_count: 0,
        created_at: Some(now),
        updated_at: Some(now),
        legacy_created_at: None,
        legacy_updated_at: None,
        extra: Map::new(),
    }
}

fn fix_orphans(state: &mut GraphState, now: DateTime<Utc>, pass: &mut Pass) {
    for pos in 0..state.persons.len() {
        let person_id = state.persons[pos].id.clone();
        let mut tags = std::mem::take(&mut state.persons[pos].tags);
        let mut changed = false;

        for snapshot in tags.iter_mut() {
            if state.tag(&snapshot.id).is_some() {
                continue;
            }
            let wanted = match snapshot.name.trim() {
                "" => snapshot.id.clone(),
                name => name.to_string(),
            };

            if let Some(existing) = state.find_tag_by_name(&wanted) {
                pass.note(format!(
                    "Re-pointed person {} from missing tag {} to existing tag {} (\"{}\")",
                    person_id, snapshot.id, existing.id, existing.name
                ));
                *snapshot = existing.snapshot();
            } else {
                pass.note(format!(
                    "Created placeholder tag {} (\"{}\") referenced by person {}",
                    snapshot.id, wanted, person_id
                ));
                state.tags.push(placeholder(&snapshot.id, &wanted, now));
                snapshot.name = wanted;
                pass.touched.tags = true;
            }
            pass.report.orphans_fixed += 1;
            changed = true;
        }

        if changed {
            // re-pointing can land two references on the same tag
            clean_list(&mut tags, None);
            pass.touched.persons = true;
        }
        state.persons[pos].tags = tags;
    }

    let known: HashSet<String> = state.tags.iter().map(|t| t.id.clone()).collect();
    for tag in state.tags.iter_mut() {
        let before = tag.parent_tags.len() + tag.child_tags.len();
        tag.parent_tags.retain(|t| known.contains(&t.id));
        tag.child_tags.retain(|t| known.contains(&t.id));
        let dropped = before - tag.parent_tags.len() - tag.child_tags.len();
        if dropped > 0 {
            pass.report.orphans_fixed += dropped;
            pass.touched.tags = true;
            pass.note(format!(
                "Dropped {} hierarchy reference(s) to missing tags from tag {}",
                dropped, tag.id
            ));
        }
    }
}

/// Replace references to merged-away ids with the surviving tag
fn repoint(list: &mut Vec<TagSnapshot>, redirect: &HashMap<String, TagSnapshot>) -> bool {
    let mut changed = false;
    for snapshot in list.iter_mut() {
        if let Some(target) = redirect.get(&snapshot.id) {
            *snapshot = target.clone();
            changed = true;
        }
    }
    if changed {
        clean_list(list, None);
    }
    changed
}

fn merge_duplicates(state: &mut GraphState, pass: &mut Pass) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (pos, tag) in state.tags.iter().enumerate() {
        groups.entry(name_key(&tag.name)).or_default().push(pos);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().filter(|g| g.len() > 1).collect();
    if groups.is_empty() {
        return;
    }
    groups.sort();

    // discarded id -> surviving tag
    let mut redirect: HashMap<String, TagSnapshot> = HashMap::new();
    for group in groups {
        // Highest count wins, then earliest creation (unknown dates last), then file order
        let keep = group.iter().copied().min_by_key(|&pos| {
            let tag = &state.tags[pos];
            (
                Reverse(canonical_connections(state, tag).len()),
                tag.created_at.is_none(),
                tag.created_at,
                pos,
            )
        });
        let Some(keep) = keep else {
            continue;
        };
        let kept = state.tags[keep].snapshot();
        for pos in group.into_iter().filter(|&pos| pos != keep) {
            let discarded = &state.tags[pos];
            pass.note(format!(
                "Merged duplicate tag {} (\"{}\") into {} (\"{}\")",
                discarded.id, discarded.name, kept.id, kept.name
            ));
            redirect.insert(discarded.id.clone(), kept.clone());
            pass.report.duplicates_merged += 1;
        }
    }

    for person in state.persons.iter_mut() {
        if repoint(&mut person.tags, &redirect) {
            pass.touched.persons = true;
        }
    }
    for tag in state.tags.iter_mut() {
        repoint(&mut tag.parent_tags, &redirect);
        repoint(&mut tag.child_tags, &redirect);
    }

    let mut inherited: HashMap<String, (Vec<TagSnapshot>, Vec<TagSnapshot>)> = HashMap::new();
    for tag in state.tags.iter() {
        if let Some(kept) = redirect.get(&tag.id) {
            let entry = inherited.entry(kept.id.clone()).or_default();
            entry.0.extend(tag.parent_tags.iter().cloned());
            entry.1.extend(tag.child_tags.iter().cloned());
        }
    }

    state.tags.retain(|t| !redirect.contains_key(&t.id));
    for tag in state.tags.iter_mut() {
        if let Some((parents, children)) = inherited.remove(&tag.id) {
            for parent in parents {
                insert_ref(&mut tag.parent_tags, parent);
            }
            for child in children {
                insert_ref(&mut tag.child_tags, child);
            }
        }
        clean_list(&mut tag.parent_tags, Some(tag.id.as_str()));
        clean_list(&mut tag.child_tags, Some(tag.id.as_str()));
    }
    pass.touched.tags = true;
}

fn repair_links(state: &mut GraphState, pass: &mut Pass) {
    let mut missing: Vec<(String, Side, TagSnapshot)> = Vec::new();
    for tag in &state.tags {
        for parent in &tag.parent_tags {
            if state.tag(&parent.id).is_some_and(|p| !p.has_child(&tag.id)) {
                missing.push((parent.id.clone(), Side::Children, tag.snapshot()));
            }
        }
        for child in &tag.child_tags {
            if state.tag(&child.id).is_some_and(|c| !c.has_parent(&tag.id)) {
                missing.push((child.id.clone(), Side::Parents, tag.snapshot()));
            }
        }
    }

    for (target, side, snapshot) in missing {
        let Some(tag) = state.tag_mut(&target) else {
            continue;
        };
        let detail = format!(
            "Added missing {} link {} on tag {}",
            match side {
                Side::Parents => "parent",
                Side::Children => "child",
            },
            snapshot.id,
            target
        );
        if insert_ref(side.list_mut(tag), snapshot) {
            pass.report.links_repaired += 1;
            pass.touched.tags = true;
            pass.note(detail);
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::store::invariants;
    use crate::store::state::test_support::{person, tag};
    use proptest::prelude::*;

    /// Blank, padded and case-variant names so merges and placeholders both occur
    const NAMES: [&str; 7] = ["Go", "go", "Rust", " rust ", "", "Infra", "INFRA"];

    /// Ids run past the number of generated tags, so some references dangle
    fn arb_refs() -> impl Strategy<Value = Vec<TagSnapshot>> {
        proptest::collection::vec(
            (0u8..12, 0..NAMES.len())
                .prop_map(|(id, name)| TagSnapshot::new(format!("t{}", id), NAMES[name])),
            0..5,
        )
    }

    fn arb_state() -> impl Strategy<Value = GraphState> {
        let tags = proptest::collection::vec(
            (0..NAMES.len(), arb_refs(), arb_refs(), 0usize..6),
            0..8,
        );
        let persons = proptest::collection::vec(arb_refs(), 0..5);
        (tags, persons).prop_map(|(tags, persons)| {
            let tags = tags
                .into_iter()
                .enumerate()
                .map(|(i, (name, parents, children, count))| {
                    let mut t = tag(&format!("t{}", i), NAMES[name]);
                    t.parent_tags = parents;
                    t.child_tags = children;
                    t.connection_count = count;
                    t
                })
                .collect();
            let persons = persons
                .into_iter()
                .enumerate()
                .map(|(i, refs)| {
                    let mut p = person(&format!("p{}", i), "Someone");
                    p.tags = refs;
                    p
                })
                .collect();
            GraphState::new(persons, tags)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn repair_restores_invariants_and_settles(mut state in arb_state()) {
            let now = Utc::now();
            repair(&mut state, now);
            let violations = invariants::check(&state);
            prop_assert!(violations.is_empty(), "after repair: {:?}", violations);

            let repaired = state.clone();
            let (report, touched) = repair(&mut state, now);
            prop_assert!(report.is_clean(), "second pass found: {:?}", report.details);
            prop_assert_eq!(touched, Touched::NONE);
            prop_assert_eq!(&state, &repaired);
        }
    }
}
