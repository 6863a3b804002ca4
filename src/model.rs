use std::collections::HashMap;

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the crate uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Widen both edges by `by` ms.
    pub fn expand(&self, by: Ms) -> Span {
        Span::new(self.start - by, self.end + by)
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Scheduling rules of a bookable facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPolicy {
    pub min_duration: Ms,
    pub max_duration: Option<Ms>,
    /// Idle time required between two bookings.
    pub buffer: Ms,
    /// Step between candidate start times when listing slots.
    pub granularity: Ms,
    /// How far ahead of now a booking may start.
    pub advance_horizon: Option<Ms>,
    /// Cancellations are refused this close to the start.
    pub cancellation_cutoff: Option<Ms>,
    /// Offset of the facility's local time from UTC; windows are local.
    pub utc_offset_minutes: i32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_duration: 30 * MINUTE_MS,
            max_duration: None,
            buffer: 0,
            granularity: 30 * MINUTE_MS,
            advance_horizon: None,
            cancellation_cutoff: None,
            utc_offset_minutes: 0,
        }
    }
}

impl BookingPolicy {
    pub fn utc_offset_ms(&self) -> Ms {
        Ms::from(self.utc_offset_minutes) * MINUTE_MS
    }
}

/// Recurring weekly opening, in minutes of the facility's local day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub weekday: Weekday,
    pub start_minute: u32,
    /// Exclusive; 1440 means midnight at the end of the day.
    pub end_minute: u32,
    pub effective_from: Option<NaiveDate>,
    pub effective_until: Option<NaiveDate>,
}

impl AvailabilityWindow {
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        date.weekday() == self.weekday
            && self.effective_from.is_none_or(|from| from <= date)
            && self.effective_until.is_none_or(|until| date <= until)
    }

    /// Window as ms offsets from local midnight.
    pub fn day_span(&self) -> Span {
        Span::new(
            Ms::from(self.start_minute) * MINUTE_MS,
            Ms::from(self.end_minute) * MINUTE_MS,
        )
    }
}

/// Ad-hoc absolute period during which a facility cannot be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

/// A scheduled instance of a program, optionally with its own capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Ulid,
    pub program_id: Ulid,
    pub starts_at: Option<Ms>,
    pub capacity: Option<u32>,
}

/// A confirmed facility booking as seen by the conflict detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub reservation_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct Facility {
    pub policy: BookingPolicy,
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `span.start`.
    pub closures: Vec<Closure>,
    /// Confirmed bookings only, sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Every reservation ever made on this facility, including cancelled ones.
    pub reservations: HashMap<Ulid, Reservation>,
}

impl Facility {
    pub fn new(policy: BookingPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, reservation_id: Ulid) -> Option<Booking> {
        let pos = self
            .bookings
            .iter()
            .position(|b| b.reservation_id == reservation_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn insert_closure(&mut self, closure: Closure) {
        let pos = self
            .closures
            .binary_search_by_key(&closure.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.closures.insert(pos, closure);
    }

    pub fn remove_closure(&mut self, id: Ulid) -> Option<Closure> {
        let pos = self.closures.iter().position(|c| c.id == id)?;
        Some(self.closures.remove(pos))
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Seats per occurrence unless the occurrence overrides it.
    pub capacity: u32,
    pub occurrences: HashMap<Ulid, Occurrence>,
}

#[derive(Debug, Clone)]
pub enum ResourceKind {
    Facility(Facility),
    Program(Program),
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub kind: ResourceKind,
}

impl ResourceState {
    pub fn facility(id: Ulid, name: Option<String>, policy: BookingPolicy) -> Self {
        Self {
            id,
            name,
            active: true,
            kind: ResourceKind::Facility(Facility::new(policy)),
        }
    }

    pub fn program(id: Ulid, name: Option<String>, capacity: u32) -> Self {
        Self {
            id,
            name,
            active: true,
            kind: ResourceKind::Program(Program {
                capacity,
                occurrences: HashMap::new(),
            }),
        }
    }

    pub fn as_facility(&self) -> Option<&Facility> {
        match &self.kind {
            ResourceKind::Facility(f) => Some(f),
            ResourceKind::Program(_) => None,
        }
    }

    pub fn as_facility_mut(&mut self) -> Option<&mut Facility> {
        match &mut self.kind {
            ResourceKind::Facility(f) => Some(f),
            ResourceKind::Program(_) => None,
        }
    }

    pub fn as_program(&self) -> Option<&Program> {
        match &self.kind {
            ResourceKind::Program(p) => Some(p),
            ResourceKind::Facility(_) => None,
        }
    }

    pub fn as_program_mut(&mut self) -> Option<&mut Program> {
        match &mut self.kind {
            ResourceKind::Program(p) => Some(p),
            ResourceKind::Facility(_) => None,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Confirmed,
    Waitlisted,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Confirmed => "confirmed",
            Status::Waitlisted => "waitlisted",
            Status::Cancelled => "cancelled",
        }
    }
}

/// The confirmed-seat set a program reservation competes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeatKey {
    pub resource_id: Ulid,
    pub occurrence_id: Option<Ulid>,
}

/// Where a reservation's authoritative record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holder {
    Facility(Ulid),
    Seats(SeatKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub at: Ms,
    pub by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub occurrence_id: Option<Ulid>,
    pub requester: String,
    pub participant: String,
    /// Facility bookings only.
    pub span: Option<Span>,
    pub status: Status,
    pub idempotency_key: Option<String>,
    pub created_at: Ms,
    pub cancellation: Option<Cancellation>,
}

impl Reservation {
    pub fn holder(&self) -> Holder {
        if self.span.is_some() {
            Holder::Facility(self.resource_id)
        } else {
            Holder::Seats(SeatKey {
                resource_id: self.resource_id,
                occurrence_id: self.occurrence_id,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub reservation_id: Ulid,
    pub participant: String,
    pub position: u32,
    /// Opt-in to a notification on promotion.
    pub notify: bool,
}

/// Inbound `CreateReservation` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub occurrence_id: Option<Ulid>,
    pub requester: String,
    /// Defaults to the requester.
    pub participant: Option<String>,
    pub span: Option<Span>,
    pub idempotency_key: Option<String>,
    pub notify: bool,
}

impl ReservationRequest {
    pub fn seat(resource_id: Ulid, occurrence_id: Option<Ulid>, requester: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            occurrence_id,
            requester: requester.into(),
            participant: None,
            span: None,
            idempotency_key: None,
            notify: true,
        }
    }

    pub fn booking(resource_id: Ulid, span: Span, requester: impl Into<String>) -> Self {
        Self {
            span: Some(span),
            ..Self::seat(resource_id, None, requester)
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    pub fn participant(&self) -> &str {
        self.participant.as_deref().unwrap_or(&self.requester)
    }
}

/// Result of arbitration as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub reservation_id: Ulid,
    pub status: Status,
    pub position: Option<u32>,
    /// True when an existing reservation was returned instead of a new decision.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub reservation_id: Ulid,
    pub promoted: Option<Ulid>,
}

// ── Outbox ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Confirmation,
    Waitlisted,
    Promoted,
    Reminder { lead: Ms },
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Confirmation => "confirmation",
            NotificationKind::Waitlisted => "waitlisted",
            NotificationKind::Promoted => "promoted",
            NotificationKind::Reminder { .. } => "reminder",
        }
    }
}

/// References to the entities a notification is about; resolved at delivery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub reservation_id: Ulid,
    pub resource_id: Ulid,
    pub occurrence_id: Option<Ulid>,
    pub participant: String,
    pub position: Option<u32>,
    pub starts_at: Option<Ms>,
    /// Recorded for audit but not sent (participant opted out).
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Ulid,
    pub kind: NotificationKind,
    pub payload: NotificationPayload,
    pub not_before: Option<Ms>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Ms,
}

impl OutboxEntry {
    pub fn is_abandoned(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Dedup key for reminders: one per reservation, participant and lead time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderKey {
    pub reservation_id: Ulid,
    pub participant: String,
    pub lead: Ms,
}

/// Promotion carried inside the cancellation that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub reservation_id: Ulid,
    pub outbox: OutboxEntry,
}

/// WAL record format. Flat, no nesting beyond value types.
/// A decision and the notification it produces always travel in one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: Ulid,
        name: Option<String>,
        policy: BookingPolicy,
    },
    ProgramCreated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
    },
    OccurrenceAdded {
        occurrence: Occurrence,
    },
    ResourceDeactivated {
        id: Ulid,
    },
    WindowAdded {
        resource_id: Ulid,
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    ClosureAdded {
        resource_id: Ulid,
        closure: Closure,
    },
    ClosureRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
        waitlist: Option<WaitlistEntry>,
        outbox: OutboxEntry,
    },
    ReservationCancelled {
        id: Ulid,
        holder: Holder,
        at: Ms,
        by: String,
        promotion: Option<Promotion>,
    },
    OutboxDelivered {
        id: Ulid,
    },
    OutboxFailed {
        id: Ulid,
        attempts: u32,
        error: String,
        not_before: Option<Ms>,
    },
    ReminderScheduled {
        key: ReminderKey,
        entry: Option<OutboxEntry>,
    },
    // Compaction snapshot records
    ReservationRestored {
        reservation: Reservation,
        waitlist: Option<WaitlistEntry>,
    },
    WaitlistWatermark {
        key: SeatKey,
        last_position: u32,
    },
    OutboxRestored {
        entry: OutboxEntry,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub is_facility: bool,
    pub capacity: Option<u32>,
}
