use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::ledger::SeatLedger;
use super::{Engine, EngineError};

impl Engine {
    /// Cancel a reservation on behalf of `requester`.
    ///
    /// Cancelling a confirmed seat promotes the lowest-positioned waitlist
    /// entry in the same commit. Cancelling a waitlisted seat only removes it
    /// from the waitlist.
    pub async fn cancel_reservation(&self, id: Ulid, requester: &str) -> Result<CancelOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let holder = self.holder_of(&id).ok_or(EngineError::NotFound(id))?;
        let outcome = match holder {
            Holder::Facility(resource_id) => self.cancel_booking(id, resource_id, requester).await?,
            Holder::Seats(key) => self.cancel_seat(id, key, requester).await?,
        };

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        if let Some(promoted) = outcome.promoted {
            metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(1);
            info!(%id, %promoted, "reservation cancelled, waitlist promoted");
        } else {
            info!(%id, "reservation cancelled");
        }
        Ok(outcome)
    }

    fn check_cancellable(&self, reservation: &Reservation, requester: &str) -> Result<(), EngineError> {
        if reservation.requester != requester
            && !self.directory.may_act_for(requester, &reservation.participant)
        {
            return Err(EngineError::NotOwner {
                requester: requester.to_owned(),
                subject: reservation.id.to_string(),
            });
        }
        if reservation.status == Status::Cancelled {
            return Err(EngineError::AlreadyCancelled(reservation.id));
        }
        Ok(())
    }

    async fn cancel_booking(
        &self,
        id: Ulid,
        resource_id: Ulid,
        requester: &str,
    ) -> Result<CancelOutcome, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = self.bounded(rs.write()).await?;
        let now = self.clock.now_ms();
        let facility = guard.as_facility().ok_or(EngineError::NotFound(id))?;
        let reservation = facility
            .reservations
            .get(&id)
            .ok_or(EngineError::NotFound(id))?;
        self.check_cancellable(reservation, requester)?;
        if let (Some(cutoff), Some(span)) = (facility.policy.cancellation_cutoff, reservation.span)
            && now > span.start.saturating_sub(cutoff)
        {
            return Err(EngineError::CancellationCutoff { cutoff });
        }

        let event = Event::ReservationCancelled {
            id,
            holder: Holder::Facility(resource_id),
            at: now,
            by: requester.to_owned(),
            promotion: None,
        };
        self.commit_resource(&mut guard, event).await?;
        Ok(CancelOutcome {
            reservation_id: id,
            promoted: None,
        })
    }

    async fn cancel_seat(&self, id: Ulid, key: SeatKey, requester: &str) -> Result<CancelOutcome, EngineError> {
        // Resource lock first, then the ledger, same order as arbitration.
        let rs = self
            .get_resource(&key.resource_id)
            .ok_or(EngineError::NotFound(key.resource_id))?;
        let guard = self.bounded(rs.read()).await?;
        let starts_at = key
            .occurrence_id
            .and_then(|occ| guard.as_program()?.occurrences.get(&occ)?.starts_at);

        let ledger = self.get_ledger(&key).ok_or(EngineError::NotFound(id))?;
        let mut ledger = self.bounded(ledger.lock()).await?;
        let reservation = ledger.reservations.get(&id).ok_or(EngineError::NotFound(id))?;
        self.check_cancellable(reservation, requester)?;

        let now = self.clock.now_ms();
        let promotion = match reservation.status {
            Status::Confirmed => self.select_promotion(&ledger, starts_at, now),
            _ => None,
        };
        let promoted = promotion.as_ref().map(|p| p.reservation_id);
        let event = Event::ReservationCancelled {
            id,
            holder: Holder::Seats(key),
            at: now,
            by: requester.to_owned(),
            promotion,
        };
        self.commit_ledger(&mut ledger, event).await?;
        drop(guard);

        Ok(CancelOutcome {
            reservation_id: id,
            promoted,
        })
    }

    /// The waitlist head and the notification it is owed. Participants who
    /// opted out still get the entry written, flagged silent.
    fn select_promotion(&self, ledger: &SeatLedger, starts_at: Option<Ms>, now: Ms) -> Option<Promotion> {
        let head = ledger.head()?;
        let promoted = ledger.reservations.get(&head.reservation_id)?;
        let outbox = self.new_outbox_entry(
            NotificationKind::Promoted,
            promoted,
            None,
            starts_at,
            !head.notify,
            now,
        );
        Some(Promotion {
            reservation_id: promoted.id,
            outbox,
        })
    }
}
