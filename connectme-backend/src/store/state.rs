//! In-memory collections and the mutation logic behind every store
//! operation. Nothing in here knows about locks, versions or disk; the
//! caller passes the clock in and receives back which collections changed.

use chrono::{DateTime, Utc};
use connectme_types::{
    DEFAULT_TAG_COLOR, NewPerson, NewTag, Person, PersonPatch, Tag, TagPatch, TagRef, TagSnapshot,
};
use serde_json::Map;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::kind::{CollectionKind, Touched};
use super::relationships::{self, Side};
use crate::error::{StoreError, StoreResult, ValidationError};

/// Case-insensitive comparison key for tag names
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn required_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField { field: "name" });
    }
    Ok(trimmed.to_string())
}

fn assign_id<F>(requested: Option<String>, taken: F) -> Result<String, ValidationError>
where
    F: Fn(&str) -> bool,
{
    match requested
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(id) if taken(&id) => Err(ValidationError::DuplicateId { id }),
        Some(id) => Ok(id),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

fn color_or_default(color: Option<String>) -> String {
    color
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_TAG_COLOR.to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    pub persons: Vec<Person>,
    pub tags: Vec<Tag>,
}

impl GraphState {
    pub fn new(persons: Vec<Person>, tags: Vec<Tag>) -> Self {
        Self { persons, tags }
    }

    pub fn person(&self, id: &str) -> Option<&Person> {
        self.persons.iter().find(|p| p.id == id)
    }

    pub fn person_mut(&mut self, id: &str) -> Option<&mut Person> {
        self.persons.iter_mut().find(|p| p.id == id)
    }

    pub fn tag(&self, id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == id)
    }

    pub fn tag_mut(&mut self, id: &str) -> Option<&mut Tag> {
        self.tags.iter_mut().find(|t| t.id == id)
    }

    fn person_position(&self, id: &str) -> Option<usize> {
        self.persons.iter().position(|p| p.id == id)
    }

    fn tag_position(&self, id: &str) -> Option<usize> {
        self.tags.iter().position(|t| t.id == id)
    }

    /// Case-insensitive lookup by name
    pub fn find_tag_by_name(&self, name: &str) -> Option<&Tag> {
        let key = name_key(name);
        self.tags.iter().find(|t| name_key(&t.name) == key)
    }

    fn ensure_unique_name(&self, name: &str, except: Option<&str>) -> Result<(), ValidationError> {
        match self.find_tag_by_name(name) {
            Some(existing) if Some(existing.id.as_str()) != except => {
                Err(ValidationError::DuplicateName {
                    name: name.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Turn boundary references into canonical snapshots carrying the current
    /// tag names. Duplicates collapse to their first occurrence. `owner` is the
    /// tag whose hierarchy is being set, which may not reference itself.
    pub fn resolve_refs(
        &self,
        refs: &[TagRef],
        owner: Option<&str>,
    ) -> Result<Vec<TagSnapshot>, ValidationError> {
        let mut out: Vec<TagSnapshot> = Vec::with_capacity(refs.len());
        for r in refs {
            let id = r.id().trim();
            if owner == Some(id) {
                return Err(ValidationError::SelfReference { id: id.to_string() });
            }
            let tag = self
                .tag(id)
                .ok_or_else(|| ValidationError::UnknownTag { id: id.to_string() })?;
            relationships::insert_ref(&mut out, tag.snapshot());
        }
        Ok(out)
    }

    // =====================================================
    // Persons
    // =====================================================

    pub fn insert_person(
        &mut self,
        new: NewPerson,
        now: DateTime<Utc>,
    ) -> Result<(Person, Touched), ValidationError> {
        let name = required_name(&new.name)?;
        let id = assign_id(new.id, |id| self.person(id).is_some())?;
        let tags = self.resolve_refs(&new.tags, None)?;
        let affected: Vec<String> = tags.iter().map(|t| t.id.clone()).collect();

        let person = Person {
            id,
            name,
            phone: new.phone,
            email: new.email,
            wechat: new.wechat,
            description: new.description,
            avatar: new.avatar,
            tags,
            created_at: Some(now),
            updated_at: Some(now),
            legacy_created_at: None,
            legacy_updated_at: None,
            legacy_profile: None,
            extra: Map::new(),
        };
        self.persons.push(person.clone());

        let counts_changed =
            relationships::recompute_connections(self, affected.iter().map(String::as_str));
        Ok((person, Touched::PERSONS | tags_if(counts_changed)))
    }

    pub fn patch_person(
        &mut self,
        id: &str,
        patch: PersonPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<(Person, Touched)> {
        let pos = self
            .person_position(id)
            .ok_or_else(|| StoreError::not_found(CollectionKind::Persons, id))?;
        let name = patch.name.as_deref().map(required_name).transpose()?;
        let tags = patch
            .tags
            .as_deref()
            .map(|refs| self.resolve_refs(refs, None))
            .transpose()?;

        let mut affected: BTreeSet<String> = BTreeSet::new();
        let person = &mut self.persons[pos];
        if let Some(name) = name {
            person.name = name;
        }
        if let Some(phone) = patch.phone {
            person.phone = phone;
        }
        if let Some(email) = patch.email {
            person.email = email;
        }
        if let Some(wechat) = patch.wechat {
            person.wechat = wechat;
        }
        if let Some(description) = patch.description {
            person.description = description;
        }
        if let Some(avatar) = patch.avatar {
            person.avatar = avatar;
        }
        if let Some(tags) = tags {
            affected.extend(person.tags.iter().map(|t| t.id.clone()));
            affected.extend(tags.iter().map(|t| t.id.clone()));
            person.tags = tags;
        }
        person.updated_at = Some(now);
        let person = person.clone();

        let counts_changed =
            relationships::recompute_connections(self, affected.iter().map(String::as_str));
        Ok((person, Touched::PERSONS | tags_if(counts_changed)))
    }

    pub fn remove_person(&mut self, id: &str) -> StoreResult<(Person, Touched)> {
        let pos = self
            .person_position(id)
            .ok_or_else(|| StoreError::not_found(CollectionKind::Persons, id))?;
        let removed = self.persons.remove(pos);

        let counts_changed =
            relationships::recompute_connections(self, removed.tags.iter().map(|t| t.id.as_str()));
        Ok((removed, Touched::PERSONS | tags_if(counts_changed)))
    }

    // =====================================================
    // Tags
    // =====================================================

    pub fn insert_tag(
        &mut self,
        new: NewTag,
        now: DateTime<Utc>,
    ) -> Result<(Tag, Touched), ValidationError> {
        let name = required_name(&new.name)?;
        self.ensure_unique_name(&name, None)?;
        let id = assign_id(new.id, |id| self.tag(id).is_some())?;
        let parents = self.resolve_refs(&new.parent_tags, Some(id.as_str()))?;
        let children = self.resolve_refs(&new.child_tags, Some(id.as_str()))?;

        let pos = self.tags.len();
        self.tags.push(Tag {
            id: id.clone(),
            name,
            description: new.description,
            color: color_or_default(new.color),
            parent_tags: Vec::new(),
            child_tags: Vec::new(),
            connections: Vec::new(),
            connection_count: 0,
            created_at: Some(now),
            updated_at: Some(now),
            legacy_created_at: None,
            legacy_updated_at: None,
            extra: Map::new(),
        });

        let mut affected = BTreeSet::from([id.clone()]);
        affected.extend(relationships::set_links(self, &id, Side::Parents, parents, now));
        affected.extend(relationships::set_links(self, &id, Side::Children, children, now));
        relationships::recompute_connections(self, affected.iter().map(String::as_str));

        Ok((self.tags[pos].clone(), Touched::TAGS))
    }

    pub fn patch_tag(
        &mut self,
        id: &str,
        patch: TagPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<(Tag, Touched)> {
        let pos = self
            .tag_position(id)
            .ok_or_else(|| StoreError::not_found(CollectionKind::Tags, id))?;
        let name = match patch.name.as_deref() {
            Some(raw) => {
                let name = required_name(raw)?;
                self.ensure_unique_name(&name, Some(id))?;
                Some(name)
            }
            None => None,
        };
        let parents = patch
            .parent_tags
            .as_deref()
            .map(|refs| self.resolve_refs(refs, Some(id)))
            .transpose()?;
        let children = patch
            .child_tags
            .as_deref()
            .map(|refs| self.resolve_refs(refs, Some(id)))
            .transpose()?;

        let mut touched = Touched::TAGS;
        {
            let tag = &mut self.tags[pos];
            if let Some(description) = patch.description {
                tag.description = description;
            }
            if patch.color.is_some() {
                tag.color = color_or_default(patch.color);
            }
            tag.updated_at = Some(now);
        }

        if let Some(name) = name {
            if self.tags[pos].name != name {
                self.tags[pos].name = name.clone();
                let (_, persons_changed) = relationships::rename_snapshots(self, id, &name);
                touched.persons = persons_changed;
            }
        }

        let mut affected = BTreeSet::from([id.to_string()]);
        if let Some(parents) = parents {
            affected.extend(relationships::set_links(self, id, Side::Parents, parents, now));
        }
        if let Some(children) = children {
            affected.extend(relationships::set_links(self, id, Side::Children, children, now));
        }
        relationships::recompute_connections(self, affected.iter().map(String::as_str));

        Ok((self.tags[pos].clone(), touched))
    }

    /// Remove a tag after stripping every reference to it
    pub fn remove_tag(&mut self, id: &str, now: DateTime<Utc>) -> StoreResult<(Tag, Touched)> {
        let pos = self
            .tag_position(id)
            .ok_or_else(|| StoreError::not_found(CollectionKind::Tags, id))?;
        let removed = self.tags.remove(pos);

        let (affected, persons_changed) = relationships::detach_tag(self, &removed.id, now);
        relationships::recompute_connections(self, affected.iter().map(String::as_str));

        Ok((
            removed,
            Touched {
                persons: persons_changed,
                tags: true,
            },
        ))
    }

    // =====================================================
    // Load-time normalization
    // =====================================================

    /// Bring freshly loaded data up to the current shape: migrate the legacy
    /// `profile` field and camelCase timestamps, fill snapshot names for
    /// bare-id references and recompute connection caches. Returns which
    /// collections changed.
    pub fn normalize_loaded(&mut self) -> Touched {
        let mut touched = Touched::NONE;

        for person in self.persons.iter_mut() {
            if let Some(profile) = person.legacy_profile.take() {
                if person.description.is_empty() && !profile.is_empty() {
                    person.description = profile;
                }
                touched.persons = true;
            }
            touched.persons |=
                fold_timestamp(&mut person.created_at, &mut person.legacy_created_at);
            touched.persons |=
                fold_timestamp(&mut person.updated_at, &mut person.legacy_updated_at);
        }
        for tag in self.tags.iter_mut() {
            touched.tags |= fold_timestamp(&mut tag.created_at, &mut tag.legacy_created_at);
            touched.tags |= fold_timestamp(&mut tag.updated_at, &mut tag.legacy_updated_at);
        }

        let (_, tags_changed, persons_changed) = relationships::refresh_snapshot_names(self);
        touched = touched
            | Touched {
                persons: persons_changed,
                tags: tags_changed,
            };

        if relationships::recompute_all(self) > 0 {
            touched.tags = true;
        }
        touched
    }
}

/// Move a camelCase timestamp into its snake_case field. The snake_case value
/// wins when both were stored. Returns whether the record needs rewriting.
fn fold_timestamp(current: &mut Option<DateTime<Utc>>, legacy: &mut Option<DateTime<Utc>>) -> bool {
    match legacy.take() {
        Some(value) => {
            current.get_or_insert(value);
            true
        }
        None => false,
    }
}

fn tags_if(counts_changed: usize) -> Touched {
    if counts_changed > 0 { Touched::TAGS } else { Touched::NONE }
}

#[cfg(test)]
pub(crate) mod test_support {
    use connectme_types::{DEFAULT_TAG_COLOR, Person, Tag};
    use serde_json::Map;

    pub fn tag(id: &str, name: &str) -> Tag {
        Tag {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            color: DEFAULT_TAG_COLOR.to_string(),
            parent_tags: Vec::new(),
            child_tags: Vec::new(),
            connections: Vec::new(),
            connection_count: 0,
            created_at: None,
            updated_at: None,
            legacy_created_at: None,
            legacy_updated_at: None,
            extra: Map::new(),
        }
    }

    pub fn person(id: &str, name: &str) -> Person {
        Person {
            id: id.to_string(),
            name: name.to_string(),
            phone: String::new(),
            email: String::new(),
            wechat: String::new(),
            description: String::new(),
            avatar: String::new(),
            tags: Vec::new(),
            created_at: None,
            updated_at: None,
            legacy_created_at: None,
            legacy_updated_at: None,
            legacy_profile: None,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::person;
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn new_tag(state: &mut GraphState, name: &str) -> Tag {
        state.insert_tag(NewTag::named(name), now()).unwrap().0
    }

    #[test]
    fn test_hierarchy_scenario() {
        let mut state = GraphState::default();
        let go = new_tag(&mut state, "Go");
        assert_eq!(go.connection_count, 0);

        let (backend, _) = state
            .insert_tag(
                NewTag::named("Backend").with_children([TagRef::from(go.id.as_str())]),
                now(),
            )
            .unwrap();
        assert_eq!(backend.child_tags, vec![TagSnapshot::new(go.id.clone(), "Go")]);
        assert_eq!(backend.connection_count, 1);
        let go_now = state.tag(&go.id).unwrap();
        assert_eq!(go_now.parent_tags, vec![TagSnapshot::new(backend.id.clone(), "Backend")]);
        assert_eq!(go_now.connection_count, 1);

        let (_, touched) = state
            .insert_person(
                NewPerson::named("Alice").with_tags([TagRef::from(go.id.as_str())]),
                now(),
            )
            .unwrap();
        assert_eq!(touched, Touched::BOTH);
        assert_eq!(state.tag(&go.id).unwrap().connection_count, 2);

        let (_, touched) = state.remove_tag(&backend.id, now()).unwrap();
        assert!(!touched.persons);
        let go_now = state.tag(&go.id).unwrap();
        assert!(go_now.parent_tags.is_empty());
        assert_eq!(go_now.connection_count, 1);
    }

    #[test]
    fn test_duplicate_name_rejected_without_change() {
        let mut state = GraphState::default();
        new_tag(&mut state, "Go");
        let before = state.clone();

        let err = state.insert_tag(NewTag::named("go"), now()).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateName { name: "go".into() });
        let err = state.insert_tag(NewTag::named("  GO "), now()).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateName { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn test_blank_name_rejected() {
        let mut state = GraphState::default();
        let err = state.insert_person(NewPerson::named("   "), now()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "name" });
        assert!(state.persons.is_empty());
    }

    #[test]
    fn test_unknown_and_self_references_rejected() {
        let mut state = GraphState::default();
        let go = new_tag(&mut state, "Go");

        let err = state
            .insert_person(NewPerson::named("Alice").with_tags([TagRef::from("nope")]), now())
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownTag { id: "nope".into() });

        let patch = TagPatch {
            parent_tags: Some(vec![TagRef::from(go.id.as_str())]),
            ..Default::default()
        };
        let err = state.patch_tag(&go.id, patch, now()).unwrap_err();
        assert!(err.is_validation());
        assert!(state.tag(&go.id).unwrap().parent_tags.is_empty());
    }

    #[test]
    fn test_given_id_kept_and_collision_rejected() {
        let mut state = GraphState::default();
        let new = NewTag {
            id: Some("t-1".into()),
            ..NewTag::named("Rust")
        };
        let (tag, _) = state.insert_tag(new, now()).unwrap();
        assert_eq!(tag.id, "t-1");

        let again = NewTag {
            id: Some("t-1".into()),
            ..NewTag::named("Zig")
        };
        assert_eq!(
            state.insert_tag(again, now()).unwrap_err(),
            ValidationError::DuplicateId { id: "t-1".into() }
        );
    }

    #[test]
    fn test_person_patch_is_shallow_merge() {
        let mut state = GraphState::default();
        let go = new_tag(&mut state, "Go");
        let rust = new_tag(&mut state, "Rust");
        let mut new = NewPerson::named("Alice").with_tags([TagRef::from(go.id.as_str())]);
        new.email = "alice@example.com".into();
        let (alice, _) = state.insert_person(new, now()).unwrap();

        let patch = PersonPatch {
            phone: Some("123".into()),
            tags: Some(vec![TagRef::from(rust.id.as_str())]),
            ..Default::default()
        };
        let (alice, touched) = state.patch_person(&alice.id, patch, now()).unwrap();
        assert_eq!(touched, Touched::BOTH);
        assert_eq!(alice.email, "alice@example.com");
        assert_eq!(alice.phone, "123");
        assert_eq!(alice.tags, vec![TagSnapshot::new(rust.id.clone(), "Rust")]);
        assert_eq!(state.tag(&go.id).unwrap().connection_count, 0);
        assert_eq!(state.tag(&rust.id).unwrap().connection_count, 1);

        let (_, touched) = state
            .patch_person(
                &alice.id,
                PersonPatch {
                    phone: Some("456".into()),
                    ..Default::default()
                },
                now(),
            )
            .unwrap();
        assert_eq!(touched, Touched::PERSONS);
    }

    #[test]
    fn test_not_found() {
        let mut state = GraphState::default();
        assert!(state.patch_tag("x", TagPatch::default(), now()).unwrap_err().is_not_found());
        assert!(state.remove_person("x").unwrap_err().is_not_found());
        assert!(state.remove_tag("x", now()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_refreshes_snapshots() {
        let mut state = GraphState::default();
        let go = new_tag(&mut state, "Go");
        state
            .insert_tag(
                NewTag::named("Backend").with_children([TagRef::from(go.id.as_str())]),
                now(),
            )
            .unwrap();
        state
            .insert_person(
                NewPerson::named("Alice").with_tags([TagRef::from(go.id.as_str())]),
                now(),
            )
            .unwrap();

        let patch = TagPatch {
            name: Some("Golang".into()),
            ..Default::default()
        };
        let (_, touched) = state.patch_tag(&go.id, patch, now()).unwrap();
        assert_eq!(touched, Touched::BOTH);
        assert_eq!(state.persons[0].tags[0].name, "Golang");
        assert_eq!(state.find_tag_by_name("backend").unwrap().child_tags[0].name, "Golang");

        // Renaming to its own name in another case is not a duplicate
        let patch = TagPatch {
            name: Some("GOLANG".into()),
            ..Default::default()
        };
        assert!(state.patch_tag(&go.id, patch, now()).is_ok());
    }

    #[test]
    fn test_replacing_children_unlinks_old_ones() {
        let mut state = GraphState::default();
        let go = new_tag(&mut state, "Go");
        let rust = new_tag(&mut state, "Rust");
        let (backend, _) = state
            .insert_tag(
                NewTag::named("Backend").with_children([TagRef::from(go.id.as_str())]),
                now(),
            )
            .unwrap();

        let patch = TagPatch {
            child_tags: Some(vec![TagRef::from(rust.id.as_str())]),
            ..Default::default()
        };
        state.patch_tag(&backend.id, patch, now()).unwrap();
        assert!(state.tag(&go.id).unwrap().parent_tags.is_empty());
        assert_eq!(state.tag(&go.id).unwrap().connection_count, 0);
        assert!(state.tag(&rust.id).unwrap().has_parent(&backend.id));
        assert_eq!(state.tag(&backend.id).unwrap().connection_count, 1);
    }

    #[test]
    fn test_normalize_loaded_migrates_profile() {
        let mut bob = person("p1", "Bob");
        bob.legacy_profile = Some("likes Go".into());
        let mut state = GraphState::new(vec![bob], vec![]);

        let touched = state.normalize_loaded();
        assert!(touched.persons);
        assert_eq!(state.persons[0].description, "likes Go");
        assert!(state.persons[0].legacy_profile.is_none());
        assert_eq!(state.normalize_loaded(), Touched::NONE);
    }

    #[test]
    fn test_normalize_loaded_folds_camel_case_timestamps() {
        let persons: Vec<Person> = serde_json::from_value(serde_json::json!([
            {
                "_id": "p1",
                "name": "Bob",
                "created_at": "2023-12-01T00:00:00.000Z",
                "updated_at": "2024-01-01T00:00:00.000Z",
                "updatedAt": "2024-02-01T00:00:00.000Z"
            },
            {"_id": "p2", "name": "Carol", "createdAt": "2022-05-05T00:00:00.000Z"}
        ]))
        .unwrap();
        let tags: Vec<Tag> = serde_json::from_value(serde_json::json!([
            {"_id": "t1", "name": "Go", "updatedAt": "2024-03-03T00:00:00.000Z"}
        ]))
        .unwrap();
        let mut state = GraphState::new(persons, tags);

        let touched = state.normalize_loaded();
        assert_eq!(touched, Touched::BOTH);

        let bob = state.person("p1").unwrap();
        assert_eq!(bob.updated_at.unwrap().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(bob.legacy_updated_at.is_none());
        let carol = state.person("p2").unwrap();
        assert_eq!(carol.created_at.unwrap().to_rfc3339(), "2022-05-05T00:00:00+00:00");
        assert!(state.tag("t1").unwrap().updated_at.is_some());

        let out = serde_json::to_value(&state.persons).unwrap();
        assert!(out[0].get("updatedAt").is_none());
        assert_eq!(state.normalize_loaded(), Touched::NONE);
    }
}
