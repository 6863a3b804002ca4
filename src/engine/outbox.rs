use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::{MAX_ERROR_LEN, MAX_OUTBOX_BATCH};
use crate::model::*;

use super::{Engine, EngineError};

/// A queued notification plus its in-memory claim.
#[derive(Debug)]
pub(super) struct Queued {
    pub entry: OutboxEntry,
    pub lease_until: Option<Ms>,
}

impl Queued {
    fn is_due(&self, now: Ms) -> bool {
        !self.entry.is_abandoned()
            && self.entry.not_before.is_none_or(|t| t <= now)
            && self.lease_until.is_none_or(|t| t <= now)
    }
}

/// Pending notifications keyed by entry id. Each entry has its own lock so
/// workers can skip entries another worker is touching.
#[derive(Default)]
pub(super) struct Outbox {
    entries: DashMap<Ulid, Arc<Mutex<Queued>>>,
}

impl Outbox {
    fn insert(&self, entry: &OutboxEntry) {
        self.entries.insert(
            entry.id,
            Arc::new(Mutex::new(Queued {
                entry: entry.clone(),
                lease_until: None,
            })),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: &Ulid) -> Option<Arc<Mutex<Queued>>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Mirror a committed event. Failures are applied here only during
    /// replay; live failures are applied by `mark_failed` under the entry lock.
    pub fn record(&self, event: &Event) {
        match event {
            Event::ReservationCreated { outbox, .. } => self.insert(outbox),
            Event::ReservationCancelled {
                promotion: Some(p), ..
            } => self.insert(&p.outbox),
            Event::ReminderScheduled {
                entry: Some(entry), ..
            }
            | Event::OutboxRestored { entry } => self.insert(entry),
            Event::OutboxDelivered { id } => {
                self.entries.remove(id);
            }
            Event::OutboxFailed {
                id,
                attempts,
                error,
                not_before,
            } => {
                if let Some(slot) = self.get(id)
                    && let Ok(mut q) = slot.try_lock()
                {
                    q.entry.attempts = *attempts;
                    q.entry.last_error = Some(error.clone());
                    q.entry.not_before = *not_before;
                }
            }
            _ => {}
        }
    }

    /// Every queued entry, oldest first. Waits for entry locks.
    pub async fn snapshot(&self) -> Vec<OutboxEntry> {
        let slots: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.entry.clone());
        }
        out.sort_by_key(|e| e.id);
        out
    }
}

/// `initial * 2^(attempts-1)`, capped.
pub(crate) fn backoff_ms(attempts: u32, initial: Ms, max: Ms) -> Ms {
    let shift = attempts.saturating_sub(1).min(32);
    initial.saturating_mul(1_i64 << shift).min(max)
}

impl Engine {
    /// Claim up to `limit` due entries, oldest first. Entries locked by
    /// another caller are skipped, not waited on. Claimed entries are leased
    /// so a concurrent worker won't pick them up until the lease lapses.
    pub fn outbox_next_batch(&self, limit: usize) -> Vec<OutboxEntry> {
        let limit = limit.min(MAX_OUTBOX_BATCH);
        let now = self.clock.now_ms();
        let mut ids: Vec<Ulid> = self.outbox.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut batch = Vec::new();
        for id in ids {
            if batch.len() >= limit {
                break;
            }
            let Some(slot) = self.outbox.get(&id) else {
                continue;
            };
            let Ok(mut q) = slot.try_lock() else {
                continue;
            };
            if !q.is_due(now) {
                continue;
            }
            q.lease_until = Some(now + self.settings.outbox_lease_ms);
            batch.push(q.entry.clone());
        }
        batch
    }

    pub async fn outbox_mark_delivered(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let slot = self.outbox.get(&id).ok_or(EngineError::NotFound(id))?;
        let _q = self.bounded(slot.lock()).await?;
        if self.outbox.get(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.commit_global(Event::OutboxDelivered { id }).await?;
        metrics::counter!(crate::observability::OUTBOX_DELIVERED_TOTAL).increment(1);
        Ok(())
    }

    /// Record a failed attempt and schedule the retry. Entries that run out
    /// of attempts stay queued but are no longer handed out.
    pub async fn outbox_mark_failed(&self, id: Ulid, error: &str) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let slot = self.outbox.get(&id).ok_or(EngineError::NotFound(id))?;
        let mut q = self.bounded(slot.lock()).await?;
        if self.outbox.get(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        if q.entry.is_abandoned() {
            debug!(%id, "failure reported for abandoned notification, ignored");
            return Ok(());
        }

        let now = self.clock.now_ms();
        let attempts = q.entry.attempts + 1;
        let not_before = Some(
            now + backoff_ms(
                attempts,
                self.settings.initial_backoff_ms,
                self.settings.max_backoff_ms,
            ),
        );
        let error: String = error.chars().take(MAX_ERROR_LEN).collect();
        let event = Event::OutboxFailed {
            id,
            attempts,
            error: error.clone(),
            not_before,
        };
        self.wal_append(&event).await?;

        q.entry.attempts = attempts;
        q.entry.last_error = Some(error);
        q.entry.not_before = not_before;
        q.lease_until = None;

        metrics::counter!(crate::observability::OUTBOX_FAILED_TOTAL).increment(1);
        if q.entry.is_abandoned() {
            metrics::counter!(crate::observability::OUTBOX_ABANDONED_TOTAL).increment(1);
            warn!(%id, attempts, kind = q.entry.kind.as_str(), "notification abandoned");
        } else {
            debug!(%id, attempts, ?not_before, "notification retry scheduled");
        }
        Ok(())
    }

    /// Entries that exhausted their attempts.
    pub async fn abandoned_outbox(&self) -> Vec<OutboxEntry> {
        self.outbox
            .snapshot()
            .await
            .into_iter()
            .filter(OutboxEntry::is_abandoned)
            .collect()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Everything still queued, including abandoned entries.
    pub async fn pending_outbox(&self) -> Vec<OutboxEntry> {
        self.outbox.snapshot().await
    }
}
