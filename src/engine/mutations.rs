use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::store::{snapshot_ledger, snapshot_resource};
use super::{Engine, EngineError, WalCommand};

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_policy(policy: &BookingPolicy) -> Result<(), EngineError> {
    if policy.min_duration <= 0 {
        return Err(EngineError::InvalidRequest("min_duration must be positive"));
    }
    if policy.max_duration.is_some_and(|max| max < policy.min_duration) {
        return Err(EngineError::InvalidRequest("max_duration below min_duration"));
    }
    if policy.granularity <= 0 {
        return Err(EngineError::InvalidRequest("granularity must be positive"));
    }
    if policy.buffer < 0
        || policy.advance_horizon.is_some_and(|h| h < 0)
        || policy.cancellation_cutoff.is_some_and(|c| c < 0)
    {
        return Err(EngineError::InvalidRequest("durations must not be negative"));
    }
    if policy.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(EngineError::InvalidRequest("utc offset out of range"));
    }
    if [Some(policy.min_duration), policy.max_duration, Some(policy.buffer)]
        .into_iter()
        .flatten()
        .any(|d| d > MAX_SPAN_DURATION_MS)
    {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    if [policy.advance_horizon, policy.cancellation_cutoff]
        .into_iter()
        .flatten()
        .any(|d| d > MAX_POLICY_LEAD_MS)
    {
        return Err(EngineError::LimitExceeded("horizon or cutoff too long"));
    }
    Ok(())
}

fn validate_window(window: &AvailabilityWindow) -> Result<(), EngineError> {
    if window.start_minute >= window.end_minute || window.end_minute > MINUTES_PER_DAY {
        return Err(EngineError::InvalidRequest("window must satisfy start < end <= 24:00"));
    }
    if let (Some(from), Some(until)) = (window.effective_from, window.effective_until)
        && from > until
    {
        return Err(EngineError::InvalidRequest("effective_from after effective_until"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_facility(
        &self,
        id: Ulid,
        name: Option<String>,
        policy: BookingPolicy,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        validate_policy(&policy)?;
        let event = Event::FacilityCreated {
            id,
            name: name.clone(),
            policy,
        };
        self.create_resource(id, event, ResourceState::facility(id, name, policy))
            .await
    }

    pub async fn create_program(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        let event = Event::ProgramCreated {
            id,
            name: name.clone(),
            capacity,
        };
        self.create_resource(id, event, ResourceState::program(id, name, capacity))
            .await
    }

    async fn create_resource(
        &self,
        id: Ulid,
        event: Event,
        rs: ResourceState,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let _creating = self.key_locks.lock(&format!("resource:{id}")).await;
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.wal_append(&event).await?;
        self.resources.insert(id, Arc::new(RwLock::new(rs)));
        info!(%id, "resource created");
        Ok(())
    }

    /// Stop accepting new reservations. Existing ones are kept.
    pub async fn deactivate_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = self.bounded(rs.write()).await?;
        if !guard.active {
            return Ok(());
        }
        self.commit_resource(&mut guard, Event::ResourceDeactivated { id })
            .await?;
        info!(%id, "resource deactivated");
        Ok(())
    }

    pub async fn add_occurrence(
        &self,
        id: Ulid,
        program_id: Ulid,
        starts_at: Option<Ms>,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        if capacity.is_some_and(|c| c > MAX_CAPACITY) {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if let Some(t) = starts_at
            && !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t)
        {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let _gate = self.commit_gate.read().await;
        if self.get_resource_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_resource(&program_id)
            .ok_or(EngineError::NotFound(program_id))?;
        let mut guard = self.bounded(rs.write()).await?;
        let program = guard
            .as_program()
            .ok_or(EngineError::InvalidRequest("occurrences belong to programs"))?;
        if program.occurrences.len() >= MAX_OCCURRENCES_PER_PROGRAM {
            return Err(EngineError::LimitExceeded("too many occurrences"));
        }
        let occurrence = Occurrence {
            id,
            program_id,
            starts_at,
            capacity,
        };
        self.commit_resource(&mut guard, Event::OccurrenceAdded { occurrence })
            .await
    }

    pub async fn add_window(
        &self,
        resource_id: Ulid,
        window: AvailabilityWindow,
    ) -> Result<(), EngineError> {
        validate_window(&window)?;
        let _gate = self.commit_gate.read().await;
        if self.get_resource_for_entity(&window.id).is_some() {
            return Err(EngineError::AlreadyExists(window.id));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = self.bounded(rs.write()).await?;
        let facility = guard
            .as_facility()
            .ok_or(EngineError::InvalidRequest("windows belong to facilities"))?;
        if facility.windows.len() >= MAX_WINDOWS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many windows"));
        }
        self.commit_resource(&mut guard, Event::WindowAdded { resource_id, window })
            .await
    }

    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = self.bounded(rs.write()).await?;
        if !guard
            .as_facility()
            .is_some_and(|f| f.windows.iter().any(|w| w.id == id))
        {
            return Err(EngineError::NotFound(id));
        }
        self.commit_resource(&mut guard, Event::WindowRemoved { id, resource_id })
            .await?;
        Ok(resource_id)
    }

    /// Block a period on a facility. Existing bookings inside it are left alone.
    pub async fn add_closure(
        &self,
        resource_id: Ulid,
        id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.commit_gate.read().await;
        if self.get_resource_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = self.bounded(rs.write()).await?;
        let facility = guard
            .as_facility()
            .ok_or(EngineError::InvalidRequest("closures belong to facilities"))?;
        if facility.closures.len() >= MAX_CLOSURES_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many closures"));
        }
        let closure = Closure { id, span, reason };
        self.commit_resource(&mut guard, Event::ClosureAdded { resource_id, closure })
            .await
    }

    pub async fn remove_closure(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = self.bounded(rs.write()).await?;
        if !guard
            .as_facility()
            .is_some_and(|f| f.closures.iter().any(|c| c.id == id))
        {
            return Err(EngineError::NotFound(id));
        }
        self.commit_resource(&mut guard, Event::ClosureRemoved { id, resource_id })
            .await?;
        Ok(resource_id)
    }

    /// Rewrite the WAL as the minimal event set for current state.
    /// Writers are held off for the duration.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut resources: Vec<_> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        resources.sort_by_key(|(id, _)| *id);
        for (_, rs) in resources {
            snapshot_resource(&*rs.read().await, &mut events);
        }

        let mut ledgers: Vec<_> = self
            .ledgers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        ledgers.sort_by_key(|(key, _)| *key);
        for (_, ledger) in ledgers {
            snapshot_ledger(&*ledger.lock().await, &mut events);
        }

        for entry in self.outbox.snapshot().await {
            events.push(Event::OutboxRestored { entry });
        }
        for key in self.prune_reminder_keys(self.clock.now_ms()).await {
            events.push(Event::ReminderScheduled { key, entry: None });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        self.key_locks.prune();
        info!(events = count, "WAL compacted");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
