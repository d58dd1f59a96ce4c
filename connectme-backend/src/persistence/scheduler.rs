//! Debounced, per-collection persistence
//!
//! Each collection has its own timer. Scheduling a save (re)starts the
//! timer; when it fires, the collection is serialized *at that moment* and
//! written once, so any number of mutations inside one window cost a single
//! write of the final state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{CollectionSink, SnapshotSource};
use crate::error::PersistenceError;
use crate::store::CollectionKind;
use crate::store::events::StoreEvent;

/// Write history of one collection
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistenceStatus {
    pub writes: u64,
    pub failures: u64,
    /// Last write failed: memory holds changes the file does not
    pub diverged: bool,
    pub last_error: Option<String>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// A timer waiting to flush one collection
struct PendingSave {
    ticket: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Lane {
    /// Held for snapshot + write so two flushes of one file never overlap
    write_lock: Mutex<()>,
    status: Mutex<PersistenceStatus>,
}

pub struct PersistenceScheduler {
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn CollectionSink>,
    debounce: Duration,
    pending: DashMap<CollectionKind, PendingSave>,
    next_ticket: AtomicU64,
    persons: Lane,
    tags: Lane,
    events: broadcast::Sender<StoreEvent>,
}

impl PersistenceScheduler {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn CollectionSink>,
        debounce: Duration,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        Self {
            source,
            sink,
            debounce,
            pending: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            persons: Lane::default(),
            tags: Lane::default(),
            events,
        }
    }

    fn lane(&self, kind: CollectionKind) -> &Lane {
        match kind {
            CollectionKind::Persons => &self.persons,
            CollectionKind::Tags => &self.tags,
        }
    }

    /// Request a save of `kind` after the debounce window. A request that
    /// arrives while a timer is pending supersedes it.
    ///
    /// Outside a tokio runtime there is nothing to run the timer on, so the
    /// collection is written immediately instead.
    pub fn schedule(self: &Arc<Self>, kind: CollectionKind) {
        let Ok(handle) = Handle::try_current() else {
            // Failure is already logged and recorded in the status
            let _ = self.save_immediate(kind);
            return;
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let superseded = self.pending.insert(
            kind,
            PendingSave {
                ticket,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = superseded {
            previous.cancel.cancel();
        }

        let scheduler = Arc::clone(self);
        let debounce = self.debounce;
        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            // Still the newest request? Then this timer owns the flush and
            // runs it to completion.
            if scheduler
                .pending
                .remove_if(&kind, |_, pending| pending.ticket == ticket)
                .is_none()
            {
                return;
            }
            let _ = scheduler.flush(kind);
        });
    }

    /// Write `kind` now, dropping any pending timer for it
    pub fn save_immediate(&self, kind: CollectionKind) -> Result<(), PersistenceError> {
        if let Some((_, pending)) = self.pending.remove(&kind) {
            pending.cancel.cancel();
        }
        self.flush(kind)
    }

    /// Write every collection that has a pending timer or whose last write
    /// failed. Every such collection is attempted; the first error is
    /// returned.
    pub fn flush_pending(&self) -> Result<(), PersistenceError> {
        let mut first_error = None;
        for kind in CollectionKind::iter() {
            let was_pending = match self.pending.remove(&kind) {
                Some((_, pending)) => {
                    pending.cancel.cancel();
                    true
                }
                None => false,
            };
            if was_pending || self.lane(kind).status.lock().diverged {
                if let Err(e) = self.flush(kind) {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn flush(&self, kind: CollectionKind) -> Result<(), PersistenceError> {
        let lane = self.lane(kind);
        let _write_guard = lane.write_lock.lock();

        let result = self
            .source
            .snapshot(kind)
            .and_then(|bytes| self.sink.write(kind, &bytes));

        let mut status = lane.status.lock();
        match &result {
            Ok(()) => {
                if status.diverged {
                    log::info!("[PERSIST] {} collection is back in sync with disk", kind.as_ref());
                }
                status.writes += 1;
                status.diverged = false;
                status.last_error = None;
                status.last_saved_at = Some(Utc::now());
                log::debug!("[PERSIST] Saved {} collection", kind.as_ref());
                let _ = self.events.send(StoreEvent::Saved { kind });
            }
            Err(e) => {
                status.failures += 1;
                status.diverged = true;
                status.last_error = Some(e.to_string());
                log::error!(
                    "[PERSIST] Failed to save {} collection, memory and disk have diverged: {}",
                    kind.as_ref(),
                    e
                );
                let _ = self.events.send(StoreEvent::PersistenceFailed {
                    kind,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    pub fn status(&self, kind: CollectionKind) -> PersistenceStatus {
        self.lane(kind).status.lock().clone()
    }

    /// Collections waiting on their debounce timer
    pub fn pending_kinds(&self) -> Vec<CollectionKind> {
        let mut kinds: Vec<CollectionKind> = self.pending.iter().map(|e| *e.key()).collect();
        kinds.sort();
        kinds
    }

    pub fn diverged_kinds(&self) -> Vec<CollectionKind> {
        CollectionKind::iter()
            .filter(|kind| self.lane(*kind).status.lock().diverged)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_support::MemorySink;

    /// Serializes a per-kind counter so each write is distinguishable
    #[derive(Default)]
    struct CountingSource {
        generation: AtomicU64,
    }

    impl SnapshotSource for CountingSource {
        fn snapshot(&self, kind: CollectionKind) -> Result<Vec<u8>, PersistenceError> {
            let n = self.generation.load(Ordering::SeqCst);
            Ok(format!("{}:{}", kind.as_ref(), n).into_bytes())
        }
    }

    fn setup() -> (Arc<CountingSource>, Arc<MemorySink>, Arc<PersistenceScheduler>) {
        let source = Arc::new(CountingSource::default());
        let sink = Arc::new(MemorySink::default());
        let (events, _) = broadcast::channel(16);
        let scheduler = Arc::new(PersistenceScheduler::new(
            source.clone(),
            sink.clone(),
            Duration::from_millis(500),
            events,
        ));
        (source, sink, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_schedules_collapse_into_one_write() {
        let (source, sink, scheduler) = setup();

        for _ in 0..3 {
            source.generation.fetch_add(1, Ordering::SeqCst);
            scheduler.schedule(CollectionKind::Tags);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(sink.writes.lock().is_empty());
        assert_eq!(scheduler.pending_kinds(), vec![CollectionKind::Tags]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            *sink.writes.lock(),
            vec![(CollectionKind::Tags, "tags:3".to_string())]
        );
        assert!(scheduler.pending_kinds().is_empty());
        assert_eq!(scheduler.status(CollectionKind::Tags).writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collections_have_independent_timers() {
        let (_source, sink, scheduler) = setup();

        scheduler.schedule(CollectionKind::Persons);
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.schedule(CollectionKind::Tags);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.writes.lock().len(), 1);
        assert_eq!(sink.writes.lock()[0].0, CollectionKind::Persons);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.writes.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_immediate_supersedes_timer() {
        let (_source, sink, scheduler) = setup();

        scheduler.schedule(CollectionKind::Persons);
        scheduler.save_immediate(CollectionKind::Persons).unwrap();
        assert_eq!(sink.writes.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_marks_diverged_until_flushed() {
        let (_source, sink, scheduler) = setup();
        let mut events = scheduler.events.subscribe();
        sink.failing.store(true, Ordering::SeqCst);

        scheduler.schedule(CollectionKind::Tags);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = scheduler.status(CollectionKind::Tags);
        assert!(status.diverged);
        assert_eq!(status.failures, 1);
        assert!(status.last_error.unwrap().contains("disk full"));
        assert_eq!(scheduler.diverged_kinds(), vec![CollectionKind::Tags]);
        assert!(matches!(
            events.try_recv().unwrap(),
            StoreEvent::PersistenceFailed {
                kind: CollectionKind::Tags,
                ..
            }
        ));

        assert!(scheduler.flush_pending().is_err());

        sink.failing.store(false, Ordering::SeqCst);
        scheduler.flush_pending().unwrap();
        assert!(scheduler.diverged_kinds().is_empty());
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_pending_writes_only_dirty_collections() {
        let (_source, sink, scheduler) = setup();

        scheduler.schedule(CollectionKind::Persons);
        scheduler.flush_pending().unwrap();
        assert_eq!(
            *sink.writes.lock(),
            vec![(CollectionKind::Persons, "persons:0".to_string())]
        );

        scheduler.flush_pending().unwrap();
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[test]
    fn test_without_runtime_writes_immediately() {
        let (_source, sink, scheduler) = setup();
        scheduler.schedule(CollectionKind::Tags);
        assert_eq!(sink.writes.lock().len(), 1);
        assert!(scheduler.pending_kinds().is_empty());
    }
}
