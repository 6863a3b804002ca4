use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{admit_facility, validate_identity, validate_span};
use super::ledger::effective_capacity;
use super::{Engine, EngineError};

impl Engine {
    /// Decide a reservation request: confirm, waitlist, or reject.
    ///
    /// Requests carrying an idempotency key that has already been decided
    /// return the earlier outcome. A participant who already holds a live
    /// seat gets that seat back. Lock timeouts are retried up to
    /// `arbitration_retries` times. A request that loses a race for a
    /// facility slot is decided once more, which reports the winner as a
    /// conflict.
    pub async fn create_reservation(&self, request: ReservationRequest) -> Result<Outcome, EngineError> {
        let started = Instant::now();
        self.validate_request(&request)?;

        let mut attempt = 0;
        let mut slot_retried = false;
        let result = loop {
            match self.arbitrate(&request).await {
                // A lost race is decided afresh once; the next attempt sees the winner as a conflict.
                Err(EngineError::SlotTaken) if !slot_retried => {
                    slot_retried = true;
                    debug!(id = %request.id, "slot taken, re-deciding");
                }
                Err(e) if e.is_retryable() && attempt < self.settings.arbitration_retries => {
                    attempt += 1;
                    debug!(id = %request.id, attempt, reason = e.reason(), "retrying arbitration");
                    tokio::task::yield_now().await;
                }
                other => break other,
            }
        };

        let outcome_label = match &result {
            Ok(o) if o.replayed => "replayed",
            Ok(o) => o.status.as_str(),
            Err(e) => e.reason(),
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome_label).increment(1);
        metrics::histogram!(crate::observability::ARBITRATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if let Ok(o) = &result
            && !o.replayed
        {
            info!(
                id = %o.reservation_id,
                resource = %request.resource_id,
                status = o.status.as_str(),
                position = ?o.position,
                "reservation decided"
            );
        }
        result
    }

    fn validate_request(&self, request: &ReservationRequest) -> Result<(), EngineError> {
        validate_identity(&request.requester)?;
        let participant = request.participant();
        validate_identity(participant)?;
        if let Some(key) = &request.idempotency_key
            && (key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(EngineError::InvalidRequest("idempotency key must be 1-128 bytes"));
        }
        if let Some(span) = &request.span {
            validate_span(span)?;
        }
        if !self.directory.may_act_for(&request.requester, participant) {
            return Err(EngineError::NotOwner {
                requester: request.requester.clone(),
                subject: participant.to_owned(),
            });
        }
        Ok(())
    }

    /// One arbitration attempt under the commit gate.
    async fn arbitrate(&self, request: &ReservationRequest) -> Result<Outcome, EngineError> {
        let _gate = self.commit_gate.read().await;

        let _key_guard = match &request.idempotency_key {
            Some(key) => {
                let guard = self.bounded(self.key_locks.lock(&format!("idempotency:{key}")))
                    .await?;
                if let Some(existing) = self.index.idempotency.get(key).map(|e| *e.value()) {
                    return self.existing_outcome(existing).await;
                }
                Some(guard)
            }
            None => None,
        };
        // Held until the decision commits, so two requests reusing an id
        // cannot both pass the existence check.
        let _id_guard = self
            .bounded(self.key_locks.lock(&format!("reservation:{}", request.id)))
            .await?;
        if self.holder_of(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }

        let rs = self
            .get_resource(&request.resource_id)
            .ok_or(EngineError::NotFound(request.resource_id))?;
        let is_facility = {
            let guard = self.bounded(rs.read()).await?;
            if !guard.active {
                return Err(EngineError::ResourceInactive(guard.id));
            }
            guard.as_facility().is_some()
        };

        if is_facility {
            self.book_facility(rs, request).await
        } else {
            self.take_seat(rs, request).await
        }
    }

    async fn book_facility(
        &self,
        rs: super::SharedResourceState,
        request: &ReservationRequest,
    ) -> Result<Outcome, EngineError> {
        let span = request
            .span
            .ok_or(EngineError::InvalidRequest("facility bookings need start and end"))?;
        if request.occurrence_id.is_some() {
            return Err(EngineError::InvalidRequest("facilities have no occurrences"));
        }

        // Optimistic pass under the shared lock rejects most requests without
        // queueing behind writers.
        {
            let guard = self.bounded(rs.read()).await?;
            let facility = guard
                .as_facility()
                .ok_or(EngineError::InvalidRequest("not a facility"))?;
            admit_facility(facility, &span, self.clock.now_ms())?;
        }

        let mut guard = self.bounded(rs.write()).await?;
        if !guard.active {
            return Err(EngineError::ResourceInactive(guard.id));
        }
        let now = self.clock.now_ms();
        let facility = guard
            .as_facility()
            .ok_or(EngineError::InvalidRequest("not a facility"))?;
        if facility.bookings.len() >= MAX_BOOKINGS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many bookings on facility"));
        }
        match admit_facility(facility, &span, now) {
            // Free a moment ago, taken now: someone committed in between.
            Err(EngineError::Conflict(_)) => return Err(EngineError::SlotTaken),
            other => other?,
        }

        let reservation = self.new_reservation(request, Some(span), Status::Confirmed, now);
        let outbox = self.new_outbox_entry(
            NotificationKind::Confirmation,
            &reservation,
            None,
            Some(span.start),
            false,
            now,
        );
        let outcome = Outcome {
            reservation_id: reservation.id,
            status: Status::Confirmed,
            position: None,
            replayed: false,
        };
        self.commit_resource(
            &mut guard,
            Event::ReservationCreated {
                reservation,
                waitlist: None,
                outbox,
            },
        )
        .await?;
        Ok(outcome)
    }

    async fn take_seat(
        &self,
        rs: super::SharedResourceState,
        request: &ReservationRequest,
    ) -> Result<Outcome, EngineError> {
        if request.span.is_some() {
            return Err(EngineError::InvalidRequest("programs are reserved by occurrence, not time"));
        }
        // Shared resource lock keeps capacity and occurrences stable; the
        // ledger lock serialises decisions for this occurrence only.
        let guard = self.bounded(rs.read()).await?;
        let program = guard
            .as_program()
            .ok_or(EngineError::InvalidRequest("not a program"))?;
        let capacity = effective_capacity(program, request.occurrence_id)?;
        let starts_at = request
            .occurrence_id
            .and_then(|id| program.occurrences.get(&id))
            .and_then(|o| o.starts_at);

        let key = SeatKey {
            resource_id: request.resource_id,
            occurrence_id: request.occurrence_id,
        };
        let ledger = self.ledger(key);
        let mut ledger = self.bounded(ledger.lock()).await?;

        if let Some(existing) = ledger.active_for(request.participant()) {
            return Ok(Outcome {
                reservation_id: existing.id,
                status: existing.status,
                position: ledger.position_of(existing.id),
                replayed: true,
            });
        }
        if ledger.reservations.len() >= MAX_RESERVATIONS_PER_LEDGER {
            return Err(EngineError::LimitExceeded("too many reservations on occurrence"));
        }

        let now = self.clock.now_ms();
        let (status, position) = if ledger.confirmed_count() < capacity {
            (Status::Confirmed, None)
        } else {
            (Status::Waitlisted, Some(ledger.next_position()))
        };
        let reservation = self.new_reservation(request, None, status, now);
        let waitlist = position.map(|position| WaitlistEntry {
            reservation_id: reservation.id,
            participant: reservation.participant.clone(),
            position,
            notify: request.notify,
        });
        let kind = match status {
            Status::Waitlisted => NotificationKind::Waitlisted,
            _ => NotificationKind::Confirmation,
        };
        let outbox = self.new_outbox_entry(kind, &reservation, position, starts_at, false, now);
        let outcome = Outcome {
            reservation_id: reservation.id,
            status,
            position,
            replayed: false,
        };
        self.commit_ledger(
            &mut ledger,
            Event::ReservationCreated {
                reservation,
                waitlist,
                outbox,
            },
        )
        .await?;
        Ok(outcome)
    }

    /// The stored outcome of an already-decided reservation.
    pub(super) async fn existing_outcome(&self, id: Ulid) -> Result<Outcome, EngineError> {
        let (reservation, position) = self.get_reservation(id).await?;
        Ok(Outcome {
            reservation_id: reservation.id,
            status: reservation.status,
            position,
            replayed: true,
        })
    }

    fn new_reservation(
        &self,
        request: &ReservationRequest,
        span: Option<Span>,
        status: Status,
        now: Ms,
    ) -> Reservation {
        Reservation {
            id: request.id,
            resource_id: request.resource_id,
            occurrence_id: request.occurrence_id,
            requester: request.requester.clone(),
            participant: request.participant().to_owned(),
            span,
            status,
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
            cancellation: None,
        }
    }

    pub(super) fn new_outbox_entry(
        &self,
        kind: NotificationKind,
        reservation: &Reservation,
        position: Option<u32>,
        starts_at: Option<Ms>,
        silent: bool,
        now: Ms,
    ) -> OutboxEntry {
        OutboxEntry {
            id: Ulid::new(),
            kind,
            payload: NotificationPayload {
                reservation_id: reservation.id,
                resource_id: reservation.resource_id,
                occurrence_id: reservation.occurrence_id,
                participant: reservation.participant.clone(),
                position,
                starts_at,
                silent,
            },
            not_before: None,
            attempts: 0,
            max_attempts: self.settings.outbox_max_attempts,
            last_error: None,
            created_at: now,
        }
    }
}
