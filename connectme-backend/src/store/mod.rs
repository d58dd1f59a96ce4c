//! The contact graph store.
//!
//! `GraphStore` owns the in-memory collections and is the only way to mutate
//! them. Every mutation is validated in full, applied under one write lock,
//! then (with the lock released) advances the version marker, schedules the
//! touched collections for a debounced save and broadcasts a change event.
//! A returned entity is always already visible to subsequent reads, whether
//! or not it has reached disk yet.

pub mod events;
pub mod invariants;
pub mod kind;
pub mod relationships;
pub mod repair;
pub mod state;
pub mod version;

use chrono::Utc;
use connectme_types::{
    GraphSnapshot, NewPerson, NewTag, Person, PersonPatch, RepairReport, StoreStats, Tag, TagPatch,
    VersionInfo,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::StoreConfig;
use crate::error::{PersistenceError, StoreError, StoreResult, ValidationError};
use crate::persistence::{
    CollectionSink, JsonFileSink, PersistenceScheduler, PersistenceStatus, SnapshotSource, file_ops,
};

pub use events::StoreEvent;
pub use invariants::InvariantViolation;
pub use kind::{CollectionKind, Touched};
pub use state::GraphState;
use version::VersionPublisher;

/// A record of either collection, as returned by the kind-generic operations
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entity {
    Person(Person),
    Tag(Tag),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Person(p) => &p.id,
            Entity::Tag(t) => &t.id,
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Entity::Person(_) => CollectionKind::Persons,
            Entity::Tag(_) => CollectionKind::Tags,
        }
    }

    pub fn into_person(self) -> Option<Person> {
        match self {
            Entity::Person(p) => Some(p),
            Entity::Tag(_) => None,
        }
    }

    pub fn into_tag(self) -> Option<Tag> {
        match self {
            Entity::Tag(t) => Some(t),
            Entity::Person(_) => None,
        }
    }
}

impl SnapshotSource for RwLock<GraphState> {
    fn snapshot(&self, kind: CollectionKind) -> Result<Vec<u8>, PersistenceError> {
        let state = self.read();
        let bytes = match kind {
            CollectionKind::Persons => serde_json::to_vec_pretty(&state.persons)?,
            CollectionKind::Tags => serde_json::to_vec_pretty(&state.tags)?,
        };
        Ok(bytes)
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, ValidationError> {
    serde_json::from_value(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
}

pub struct GraphStore {
    state: Arc<RwLock<GraphState>>,
    scheduler: Arc<PersistenceScheduler>,
    version: VersionPublisher,
    events: broadcast::Sender<StoreEvent>,
    config: StoreConfig,
}

impl GraphStore {
    /// Load both collections from `config.data_dir` (creating it if needed)
    /// and return the ready store.
    pub fn open(config: StoreConfig) -> StoreResult<Arc<Self>> {
        fs::create_dir_all(&config.data_dir)
            .map_err(|e| PersistenceError::io(&config.data_dir, e))?;
        let sink = JsonFileSink::new(&config.data_dir);

        let persons: Vec<Person> = file_ops::read_collection(&sink.path(CollectionKind::Persons))?;
        let tags: Vec<Tag> = file_ops::read_collection(&sink.path(CollectionKind::Tags))?;
        log::info!(
            "[STORE] Loaded {} persons and {} tags from {}",
            persons.len(),
            tags.len(),
            config.data_dir.display()
        );

        Ok(Self::with_sink(config, GraphState::new(persons, tags), Arc::new(sink)))
    }

    /// Build a store over already-loaded records and an arbitrary sink.
    /// Legacy data is normalized (and repaired if configured) before the
    /// store is handed out.
    pub fn with_sink(
        config: StoreConfig,
        state: GraphState,
        sink: Arc<dyn CollectionSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        let state = Arc::new(RwLock::new(state));
        let scheduler = Arc::new(PersistenceScheduler::new(
            state.clone(),
            sink,
            config.save_debounce,
            events.clone(),
        ));

        let store = Arc::new(Self {
            state,
            scheduler,
            version: VersionPublisher::new(Utc::now()),
            events,
            config,
        });
        store.settle_loaded();
        store
    }

    fn settle_loaded(&self) {
        let touched = self.state.write().normalize_loaded();
        if touched.any() {
            log::info!("[STORE] Normalized loaded data, rewriting {:?}", touched.kinds());
            self.schedule(touched);
        }

        if self.config.repair_on_load {
            self.run_repair();
        } else if cfg!(debug_assertions) {
            let violations = self.invariant_violations();
            if !violations.is_empty() {
                log::warn!(
                    "[STORE] Loaded data has {} inconsistencies; run `repair` to fix them",
                    violations.len()
                );
            }
        }
    }

    fn schedule(&self, touched: Touched) {
        for kind in touched.kinds() {
            self.scheduler.schedule(kind);
        }
    }

    /// Post-mutation bookkeeping. Must be called with the state lock released:
    /// without a runtime the scheduler writes synchronously and reads the state.
    fn commit(&self, touched: Touched, event: StoreEvent) {
        self.version.advance(Utc::now());
        self.schedule(touched);

        if cfg!(debug_assertions) {
            for violation in self.invariant_violations() {
                log::warn!("[STORE] Invariant violated after {:?}: {}", event, violation);
            }
        }
        let _ = self.events.send(event);
    }

    // =====================================================
    // Persons
    // =====================================================

    pub fn create_person(&self, new: NewPerson) -> StoreResult<Person> {
        let (person, touched) = self.state.write().insert_person(new, Utc::now())?;
        log::debug!("[STORE] Created person {} ({})", person.id, person.name);
        self.commit(
            touched,
            StoreEvent::Created {
                kind: CollectionKind::Persons,
                id: person.id.clone(),
            },
        );
        Ok(person)
    }

    pub fn update_person(&self, id: &str, patch: PersonPatch) -> StoreResult<Person> {
        let (person, touched) = self.state.write().patch_person(id, patch, Utc::now())?;
        log::debug!("[STORE] Updated person {}", person.id);
        self.commit(
            touched,
            StoreEvent::Updated {
                kind: CollectionKind::Persons,
                id: person.id.clone(),
            },
        );
        Ok(person)
    }

    pub fn delete_person(&self, id: &str) -> StoreResult<Person> {
        let (person, touched) = self.state.write().remove_person(id)?;
        log::debug!("[STORE] Deleted person {}", person.id);
        self.commit(
            touched,
            StoreEvent::Deleted {
                kind: CollectionKind::Persons,
                id: person.id.clone(),
            },
        );
        Ok(person)
    }

    pub fn get_person(&self, id: &str) -> Option<Person> {
        self.state.read().person(id).cloned()
    }

    pub fn list_persons(&self) -> Vec<Person> {
        self.state.read().persons.clone()
    }

    pub fn find_persons<F>(&self, predicate: F) -> Vec<Person>
    where
        F: Fn(&Person) -> bool,
    {
        self.state.read().persons.iter().filter(|p| predicate(p)).cloned().collect()
    }

    // =====================================================
    // Tags
    // =====================================================

    pub fn create_tag(&self, new: NewTag) -> StoreResult<Tag> {
        let (tag, touched) = self.state.write().insert_tag(new, Utc::now())?;
        log::debug!("[STORE] Created tag {} ({})", tag.id, tag.name);
        self.commit(
            touched,
            StoreEvent::Created {
                kind: CollectionKind::Tags,
                id: tag.id.clone(),
            },
        );
        Ok(tag)
    }

    pub fn update_tag(&self, id: &str, patch: TagPatch) -> StoreResult<Tag> {
        let (tag, touched) = self.state.write().patch_tag(id, patch, Utc::now())?;
        log::debug!("[STORE] Updated tag {}", tag.id);
        self.commit(
            touched,
            StoreEvent::Updated {
                kind: CollectionKind::Tags,
                id: tag.id.clone(),
            },
        );
        Ok(tag)
    }

    /// Delete a tag and every reference to it
    pub fn delete_tag(&self, id: &str) -> StoreResult<Tag> {
        let (tag, touched) = self.state.write().remove_tag(id, Utc::now())?;
        log::debug!("[STORE] Deleted tag {} ({})", tag.id, tag.name);
        self.commit(
            touched,
            StoreEvent::Deleted {
                kind: CollectionKind::Tags,
                id: tag.id.clone(),
            },
        );
        Ok(tag)
    }

    pub fn get_tag(&self, id: &str) -> Option<Tag> {
        self.state.read().tag(id).cloned()
    }

    pub fn list_tags(&self) -> Vec<Tag> {
        self.state.read().tags.clone()
    }

    pub fn find_tags<F>(&self, predicate: F) -> Vec<Tag>
    where
        F: Fn(&Tag) -> bool,
    {
        self.state.read().tags.iter().filter(|t| predicate(t)).cloned().collect()
    }

    // =====================================================
    // Kind-generic surface
    // =====================================================

    /// Create from a JSON payload. Payloads that do not deserialize are
    /// rejected as `ValidationError::Malformed`.
    pub fn create(&self, kind: CollectionKind, payload: Value) -> StoreResult<Entity> {
        match kind {
            CollectionKind::Persons => {
                self.create_person(parse_payload(payload)?).map(Entity::Person)
            }
            CollectionKind::Tags => self.create_tag(parse_payload(payload)?).map(Entity::Tag),
        }
    }

    /// Shallow merge of `partial` over the stored record
    pub fn update(&self, kind: CollectionKind, id: &str, partial: Value) -> StoreResult<Entity> {
        match kind {
            CollectionKind::Persons => {
                self.update_person(id, parse_payload(partial)?).map(Entity::Person)
            }
            CollectionKind::Tags => self.update_tag(id, parse_payload(partial)?).map(Entity::Tag),
        }
    }

    pub fn delete(&self, kind: CollectionKind, id: &str) -> StoreResult<Entity> {
        match kind {
            CollectionKind::Persons => self.delete_person(id).map(Entity::Person),
            CollectionKind::Tags => self.delete_tag(id).map(Entity::Tag),
        }
    }

    pub fn get(&self, kind: CollectionKind, id: &str) -> Option<Entity> {
        match kind {
            CollectionKind::Persons => self.get_person(id).map(Entity::Person),
            CollectionKind::Tags => self.get_tag(id).map(Entity::Tag),
        }
    }

    pub fn list(&self, kind: CollectionKind) -> Vec<Entity> {
        match kind {
            CollectionKind::Persons => {
                self.list_persons().into_iter().map(Entity::Person).collect()
            }
            CollectionKind::Tags => self.list_tags().into_iter().map(Entity::Tag).collect(),
        }
    }

    // =====================================================
    // Version, maintenance, lifecycle
    // =====================================================

    pub fn version(&self) -> VersionInfo {
        self.version.current()
    }

    /// Every record plus the version marker in one read. The marker is read
    /// before the lock, so it is never newer than the records returned.
    pub fn snapshot(&self) -> GraphSnapshot {
        let version = self.version();
        let state = self.state.read();
        GraphSnapshot {
            persons: state.persons.clone(),
            tags: state.tags.clone(),
            version,
        }
    }

    /// Heal inconsistencies in place and persist the result
    pub fn run_repair(&self) -> RepairReport {
        let (report, touched) = repair::repair(&mut self.state.write(), Utc::now());
        if report.is_clean() {
            log::info!("[REPAIR] No inconsistencies found");
            return report;
        }

        log::info!(
            "[REPAIR] Fixed {} item(s): {} orphans, {} merged, {} links, {} counts, {} snapshots",
            report.items_fixed,
            report.orphans_fixed,
            report.duplicates_merged,
            report.links_repaired,
            report.counts_corrected,
            report.snapshots_refreshed
        );
        self.commit(
            touched,
            StoreEvent::Repaired {
                items_fixed: report.items_fixed,
            },
        );
        report
    }

    /// What `run_repair` would fix, without changing anything
    pub fn check_consistency(&self) -> RepairReport {
        let mut copy = self.state.read().clone();
        repair::repair(&mut copy, Utc::now()).0
    }

    pub fn invariant_violations(&self) -> Vec<InvariantViolation> {
        invariants::check(&self.state.read())
    }

    pub fn stats(&self) -> StoreStats {
        let (persons, tags) = {
            let state = self.state.read();
            (state.persons.len(), state.tags.len())
        };
        let names = |kinds: Vec<CollectionKind>| -> Vec<String> {
            kinds.iter().map(|k| k.as_ref().to_string()).collect()
        };
        StoreStats {
            persons,
            tags,
            pending_writes: names(self.scheduler.pending_kinds()),
            diverged: names(self.scheduler.diverged_kinds()),
            version: self.version(),
        }
    }

    pub fn persistence_status(&self, kind: CollectionKind) -> PersistenceStatus {
        self.scheduler.status(kind)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Write `kind` now, skipping the debounce window
    pub fn save_immediate(&self, kind: CollectionKind) -> StoreResult<()> {
        self.scheduler.save_immediate(kind).map_err(StoreError::from)
    }

    /// Flush every pending or diverged collection. Call before exit.
    pub fn shutdown(&self) -> StoreResult<()> {
        log::info!("[STORE] Flushing pending writes before shutdown");
        self.scheduler.flush_pending()?;
        log::info!("[STORE] All collections saved");
        Ok(())
    }
}
