use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::SlotQuery;
use super::conflict::{admit_facility, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Would a booking of `span` on this facility be accepted right now?
    /// Runs the same checks as arbitration without taking a write lock.
    pub async fn check_availability(&self, resource_id: Ulid, span: Span) -> Result<(), EngineError> {
        validate_span(&span)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = self.bounded(rs.read()).await?;
        if !guard.active {
            return Err(EngineError::ResourceInactive(resource_id));
        }
        let facility = guard
            .as_facility()
            .ok_or(EngineError::InvalidRequest("availability applies to facilities"))?;
        admit_facility(facility, &span, self.clock.now_ms())
    }

    /// Bookable slots of `duration` inside `range`, in start order.
    pub async fn list_available_slots(
        &self,
        resource_id: Ulid,
        range: Span,
        duration: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        validate_span(&range)?;
        if range.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = self.bounded(rs.read()).await?;
        if !guard.active {
            return Ok(Vec::new());
        }
        let facility = guard
            .as_facility()
            .ok_or(EngineError::InvalidRequest("slots apply to facilities"))?;
        let policy = &facility.policy;
        if duration < policy.min_duration || policy.max_duration.is_some_and(|max| duration > max) {
            return Err(EngineError::DurationOutOfBounds {
                duration,
                min: policy.min_duration,
                max: policy.max_duration,
            });
        }
        let query = SlotQuery::new(facility, range, duration, self.clock.now_ms())?;
        Ok(query.iter().take(MAX_SLOTS_PER_QUERY).collect())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                active: guard.active,
                is_facility: guard.as_facility().is_some(),
                capacity: guard.as_program().map(|p| p.capacity),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn resource_name(&self, id: Ulid) -> Option<String> {
        let rs = self.get_resource(&id)?;
        let guard = rs.read().await;
        guard.name.clone()
    }

    /// A reservation and, if waitlisted, its position.
    pub async fn get_reservation(&self, id: Ulid) -> Result<(Reservation, Option<u32>), EngineError> {
        match self.holder_of(&id).ok_or(EngineError::NotFound(id))? {
            Holder::Facility(resource_id) => {
                let rs = self
                    .get_resource(&resource_id)
                    .ok_or(EngineError::NotFound(resource_id))?;
                let guard = self.bounded(rs.read()).await?;
                guard
                    .as_facility()
                    .and_then(|f| f.reservations.get(&id))
                    .map(|r| (r.clone(), None))
                    .ok_or(EngineError::NotFound(id))
            }
            Holder::Seats(key) => {
                let ledger = self.get_ledger(&key).ok_or(EngineError::NotFound(id))?;
                let ledger = self.bounded(ledger.lock()).await?;
                ledger
                    .reservations
                    .get(&id)
                    .map(|r| (r.clone(), ledger.position_of(id)))
                    .ok_or(EngineError::NotFound(id))
            }
        }
    }

    /// All reservations on a facility, or on one program occurrence, oldest first.
    pub async fn list_reservations(
        &self,
        resource_id: Ulid,
        occurrence_id: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut out: Vec<Reservation> = {
            let guard = self.bounded(rs.read()).await?;
            match &guard.kind {
                ResourceKind::Facility(f) => f.reservations.values().cloned().collect(),
                ResourceKind::Program(_) => Vec::new(),
            }
        };
        let key = SeatKey {
            resource_id,
            occurrence_id,
        };
        if let Some(ledger) = self.get_ledger(&key) {
            let ledger = self.bounded(ledger.lock()).await?;
            out.extend(ledger.reservations.values().cloned());
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }

    /// Waiting entries in position order.
    pub async fn list_waitlist(
        &self,
        resource_id: Ulid,
        occurrence_id: Option<Ulid>,
    ) -> Result<Vec<WaitlistEntry>, EngineError> {
        if self.get_resource(&resource_id).is_none() {
            return Err(EngineError::NotFound(resource_id));
        }
        let key = SeatKey {
            resource_id,
            occurrence_id,
        };
        let Some(ledger) = self.get_ledger(&key) else {
            return Ok(Vec::new());
        };
        let ledger = self.bounded(ledger.lock()).await?;
        Ok(ledger.waitlisted().cloned().collect())
    }
}
