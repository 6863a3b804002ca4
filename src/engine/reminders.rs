use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// A confirmed reservation with a known start time.
struct Upcoming {
    reservation: Reservation,
    starts_at: Ms,
}

impl Engine {
    /// Enqueue one reminder per (reservation, participant, lead time) for
    /// confirmed reservations whose start falls in
    /// `[now + lead - tolerance, now + lead + tolerance]`.
    ///
    /// Keys already scheduled are skipped, so repeated or overlapping sweeps
    /// never produce a duplicate. Returns how many reminders were enqueued.
    pub async fn sweep_reminders(&self, leads: &[Ms], tolerance: Ms) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let now = self.clock.now_ms();
        let Some(horizon) = leads.iter().max().map(|l| now + l + tolerance) else {
            return Ok(0);
        };
        let upcoming = self.upcoming(now, horizon).await?;

        let mut scheduled = 0;
        for item in &upcoming {
            for &lead in leads {
                let target = now + lead;
                if item.starts_at < target - tolerance || item.starts_at > target + tolerance {
                    continue;
                }
                if self.schedule_reminder(item, lead, now).await? {
                    scheduled += 1;
                }
            }
        }
        if scheduled > 0 {
            metrics::counter!(crate::observability::REMINDERS_SCHEDULED_TOTAL).increment(scheduled as u64);
            debug!(scheduled, "reminders enqueued");
        }
        Ok(scheduled)
    }

    async fn schedule_reminder(&self, item: &Upcoming, lead: Ms, now: Ms) -> Result<bool, EngineError> {
        let r = &item.reservation;
        let key = ReminderKey {
            reservation_id: r.id,
            participant: r.participant.clone(),
            lead,
        };
        // Claim the key before writing; a concurrent sweep sees it taken.
        if !self.index.reminder_keys.insert(key.clone()) {
            return Ok(false);
        }
        let mut entry = self.new_outbox_entry(
            NotificationKind::Reminder { lead },
            r,
            None,
            Some(item.starts_at),
            false,
            now,
        );
        entry.not_before = Some(item.starts_at - lead);
        let event = Event::ReminderScheduled {
            key: key.clone(),
            entry: Some(entry),
        };
        if let Err(e) = self.commit_global(event).await {
            self.index.reminder_keys.remove(&key);
            warn!(reservation = %r.id, error = %e, "failed to schedule reminder");
            return Err(e);
        }
        Ok(true)
    }

    /// Confirmed facility bookings and program seats starting in `[now, until]`.
    async fn upcoming(&self, now: Ms, until: Ms) -> Result<Vec<Upcoming>, EngineError> {
        let mut out = Vec::new();
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();

        for rs in resources {
            let mut timed_occurrences: Vec<(Ulid, Ms)> = Vec::new();
            let resource_id = {
                let guard = self.bounded(rs.read()).await?;
                match &guard.kind {
                    ResourceKind::Facility(f) => {
                        let window = Span::new(now, until.max(now) + 1);
                        for booking in f.overlapping(&window) {
                            if booking.span.start < now || booking.span.start > until {
                                continue;
                            }
                            if let Some(r) = f.reservations.get(&booking.reservation_id) {
                                out.push(Upcoming {
                                    reservation: r.clone(),
                                    starts_at: booking.span.start,
                                });
                            }
                        }
                    }
                    ResourceKind::Program(p) => {
                        timed_occurrences.extend(
                            p.occurrences
                                .values()
                                .filter_map(|o| Some((o.id, o.starts_at?)))
                                .filter(|(_, t)| (now..=until).contains(t)),
                        );
                    }
                }
                guard.id
            };

            for (occurrence_id, starts_at) in timed_occurrences {
                let key = SeatKey {
                    resource_id,
                    occurrence_id: Some(occurrence_id),
                };
                let Some(ledger) = self.get_ledger(&key) else {
                    continue;
                };
                let ledger = self.bounded(ledger.lock()).await?;
                out.extend(
                    ledger
                        .reservations
                        .values()
                        .filter(|r| r.status == Status::Confirmed)
                        .map(|r| Upcoming {
                            reservation: r.clone(),
                            starts_at,
                        }),
                );
            }
        }
        Ok(out)
    }

    /// Forget dedup keys no sweep can match again: the reservation is gone,
    /// no longer confirmed, or already started. Returns the keys kept.
    pub(super) async fn prune_reminder_keys(&self, now: Ms) -> Vec<ReminderKey> {
        let keys: Vec<ReminderKey> = self.index.reminder_keys.iter().map(|k| k.clone()).collect();
        let mut kept = Vec::with_capacity(keys.len());
        for key in keys {
            let live = match self.get_reservation(key.reservation_id).await {
                Ok((r, _)) if r.status == Status::Confirmed => {
                    self.reservation_start(&r).await.is_some_and(|t| t >= now)
                }
                Ok(_) | Err(EngineError::NotFound(_)) => false,
                // Unsure: keep it, the next compaction decides.
                Err(_) => true,
            };
            if live {
                kept.push(key);
            } else {
                self.index.reminder_keys.remove(&key);
            }
        }
        kept
    }

    async fn reservation_start(&self, r: &Reservation) -> Option<Ms> {
        if let Some(span) = r.span {
            return Some(span.start);
        }
        let rs = self.get_resource(&r.resource_id)?;
        let guard = rs.read().await;
        guard
            .as_program()?
            .occurrences
            .get(&r.occurrence_id?)?
            .starts_at
    }
}
