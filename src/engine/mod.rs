mod arbiter;
mod availability;
mod conflict;
mod error;
mod ledger;
mod locks;
mod mutations;
mod outbox;
mod promotion;
mod queries;
mod reminders;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{SlotQuery, check_windows, merge_overlapping, open_spans, subtract_intervals};
pub use error::{EngineError, ErrorClass};
pub use ledger::{SeatLedger, effective_capacity};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::directory::{Directory, SelfDirectory};
use crate::model::*;
use crate::wal::Wal;

use locks::KeyedLocks;
use outbox::Outbox;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedLedger = Arc<Mutex<SeatLedger>>;

/// Tunables the engine needs at runtime. Built from the server config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long an operation waits for a contended lock before reporting `Busy`.
    pub lock_timeout: Duration,
    /// Extra attempts after a `Busy` or `SlotTaken`.
    pub arbitration_retries: u32,
    pub outbox_max_attempts: u32,
    /// How long a claimed outbox entry stays invisible to other workers.
    pub outbox_lease_ms: Ms,
    pub initial_backoff_ms: Ms,
    pub max_backoff_ms: Ms,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            arbitration_retries: 3,
            outbox_max_attempts: 8,
            outbox_lease_ms: 30_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't bleed into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Indexes ──────────────────────────────────────────────

/// Lookups that span aggregates. Updated after every committed event.
#[derive(Default)]
pub(super) struct Indexes {
    /// reservation id → where its record lives
    pub holders: DashMap<Ulid, Holder>,
    pub idempotency: DashMap<String, Ulid>,
    /// window / closure / occurrence id → resource id
    pub entity_to_resource: DashMap<Ulid, Ulid>,
    pub reminder_keys: DashSet<ReminderKey>,
}

impl Indexes {
    fn record(&self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation, .. }
            | Event::ReservationRestored { reservation, .. } => {
                self.holders.insert(reservation.id, reservation.holder());
                if let Some(key) = &reservation.idempotency_key {
                    self.idempotency.insert(key.clone(), reservation.id);
                }
            }
            Event::OccurrenceAdded { occurrence } => {
                self.entity_to_resource
                    .insert(occurrence.id, occurrence.program_id);
            }
            Event::WindowAdded {
                resource_id,
                window,
            } => {
                self.entity_to_resource.insert(window.id, *resource_id);
            }
            Event::ClosureAdded {
                resource_id,
                closure,
            } => {
                self.entity_to_resource.insert(closure.id, *resource_id);
            }
            Event::WindowRemoved { id, .. } | Event::ClosureRemoved { id, .. } => {
                self.entity_to_resource.remove(id);
            }
            Event::ReminderScheduled { key, .. } => {
                self.reminder_keys.insert(key.clone());
            }
            _ => {}
        }
    }
}

/// Which aggregate an event mutates.
pub(super) enum Target {
    Resource(Ulid),
    Ledger(SeatKey),
    Global,
}

pub(super) fn event_target(event: &Event) -> Target {
    let holder_target = |holder: Holder| match holder {
        Holder::Facility(id) => Target::Resource(id),
        Holder::Seats(key) => Target::Ledger(key),
    };
    match event {
        Event::FacilityCreated { id, .. }
        | Event::ProgramCreated { id, .. }
        | Event::ResourceDeactivated { id } => Target::Resource(*id),
        Event::OccurrenceAdded { occurrence } => Target::Resource(occurrence.program_id),
        Event::WindowAdded { resource_id, .. }
        | Event::WindowRemoved { resource_id, .. }
        | Event::ClosureAdded { resource_id, .. }
        | Event::ClosureRemoved { resource_id, .. } => Target::Resource(*resource_id),
        Event::ReservationCreated { reservation, .. }
        | Event::ReservationRestored { reservation, .. } => holder_target(reservation.holder()),
        Event::ReservationCancelled { holder, .. } => holder_target(*holder),
        Event::WaitlistWatermark { key, .. } => Target::Ledger(*key),
        Event::OutboxDelivered { .. }
        | Event::OutboxFailed { .. }
        | Event::ReminderScheduled { .. }
        | Event::OutboxRestored { .. } => Target::Global,
    }
}

/// Apply an event to a resource. The caller holds its lock.
/// Resource creation happens at the map level, not here.
pub(super) fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::ResourceDeactivated { .. } => rs.active = false,
        Event::OccurrenceAdded { occurrence } => {
            if let Some(p) = rs.as_program_mut() {
                p.occurrences.insert(occurrence.id, occurrence.clone());
            }
        }
        Event::WindowAdded { window, .. } => {
            if let Some(f) = rs.as_facility_mut() {
                f.windows.push(window.clone());
            }
        }
        Event::WindowRemoved { id, .. } => {
            if let Some(f) = rs.as_facility_mut() {
                f.remove_window(*id);
            }
        }
        Event::ClosureAdded { closure, .. } => {
            if let Some(f) = rs.as_facility_mut() {
                f.insert_closure(closure.clone());
            }
        }
        Event::ClosureRemoved { id, .. } => {
            if let Some(f) = rs.as_facility_mut() {
                f.remove_closure(*id);
            }
        }
        Event::ReservationCreated { reservation, .. }
        | Event::ReservationRestored { reservation, .. } => {
            if let Some(f) = rs.as_facility_mut() {
                if let (Status::Confirmed, Some(span)) = (reservation.status, reservation.span) {
                    f.insert_booking(Booking {
                        reservation_id: reservation.id,
                        span,
                    });
                }
                f.reservations.insert(reservation.id, reservation.clone());
            }
        }
        Event::ReservationCancelled { id, at, by, .. } => {
            if let Some(f) = rs.as_facility_mut() {
                f.remove_booking(*id);
                if let Some(r) = f.reservations.get_mut(id) {
                    r.status = Status::Cancelled;
                    r.cancellation = Some(Cancellation {
                        at: *at,
                        by: by.clone(),
                    });
                }
            }
        }
        _ => {}
    }
}

pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) ledgers: DashMap<SeatKey, SharedLedger>,
    pub(super) index: Indexes,
    pub(super) outbox: Outbox,
    pub(super) key_locks: KeyedLocks,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every writer and exclusively by compaction, so a
    /// snapshot never misses an event appended while it was being taken.
    pub(super) commit_gate: RwLock<()>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) settings: EngineSettings,
}

impl Engine {
    pub fn new(wal_path: PathBuf, settings: EngineSettings, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = Indexes::default();
        let outbox = Outbox::default();
        let replayed = store::replay(&events, &index, &outbox);

        let resources = DashMap::new();
        for (id, rs) in replayed.resources {
            resources.insert(id, Arc::new(RwLock::new(rs)));
        }
        let ledgers = DashMap::new();
        for (key, ledger) in replayed.ledgers {
            ledgers.insert(key, Arc::new(Mutex::new(ledger)));
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            resources = resources.len(),
            pending_notifications = outbox.len(),
            "engine recovered"
        );

        Ok(Self {
            resources,
            ledgers,
            index,
            outbox,
            key_locks: KeyedLocks::default(),
            wal_tx,
            commit_gate: RwLock::new(()),
            clock,
            directory: Arc::new(SelfDirectory),
            settings,
        })
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// Post-commit bookkeeping shared by every write path.
    fn record(&self, event: &Event) {
        self.index.record(event);
        self.outbox.record(event);
    }

    /// WAL first, then memory. Nothing is applied if the append fails.
    pub(super) async fn commit_resource(
        &self,
        rs: &mut ResourceState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        apply_to_resource(rs, &event);
        self.record(&event);
        Ok(())
    }

    pub(super) async fn commit_ledger(
        &self,
        ledger: &mut SeatLedger,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        ledger.apply(&event);
        self.record(&event);
        Ok(())
    }

    pub(super) async fn commit_global(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.record(&event);
        Ok(())
    }

    /// Bound a lock acquisition by the configured timeout.
    pub(super) async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.settings.lock_timeout, fut)
            .await
            .map_err(|_| EngineError::Busy)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.index.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn get_ledger(&self, key: &SeatKey) -> Option<SharedLedger> {
        self.ledgers.get(key).map(|e| e.value().clone())
    }

    pub(super) fn ledger(&self, key: SeatKey) -> SharedLedger {
        self.ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(SeatLedger::new(key))))
            .value()
            .clone()
    }

    pub(super) fn holder_of(&self, reservation_id: &Ulid) -> Option<Holder> {
        self.index.holders.get(reservation_id).map(|e| *e.value())
    }
}
