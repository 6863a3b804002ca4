use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("resource {0} is not accepting reservations")]
    ResourceInactive(Ulid),
    #[error("duration {duration}ms outside allowed range (min {min}ms, max {max:?}ms)")]
    DurationOutOfBounds { duration: Ms, min: Ms, max: Option<Ms> },
    #[error("start time is in the past")]
    InThePast,
    #[error("start time is more than {horizon}ms ahead")]
    TooFarInAdvance { horizon: Ms },
    #[error("no availability window on {date}")]
    OutOfWindow { date: NaiveDate },
    #[error("availability windows on {date} do not cover the requested time")]
    PartiallyOutOfWindow { date: NaiveDate },
    #[error("overlaps closure {id}: {}", .reason.as_deref().unwrap_or("closed"))]
    DuringClosure { id: Ulid, reason: Option<String> },
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    /// Lost a race for the same slot; retried internally.
    #[error("slot taken by a concurrent request")]
    SlotTaken,
    #[error("{requester} may not act for {subject}")]
    NotOwner { requester: String, subject: String },
    #[error("invalid participant: {0}")]
    InvalidParticipant(String),
    #[error("reservation {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("cancellations close {cutoff}ms before start")]
    CancellationCutoff { cutoff: Ms },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("resource busy, try again")]
    Busy,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    /// Errors the arbiter retries before surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy | EngineError::SlotTaken)
    }

    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ResourceInactive(_) => "resource_inactive",
            EngineError::DurationOutOfBounds { .. } => "duration_out_of_bounds",
            EngineError::InThePast => "in_the_past",
            EngineError::TooFarInAdvance { .. } => "too_far_in_advance",
            EngineError::OutOfWindow { .. } => "out_of_window",
            EngineError::PartiallyOutOfWindow { .. } => "partially_out_of_window",
            EngineError::DuringClosure { .. } => "during_closure",
            EngineError::Conflict(_) => "conflict",
            EngineError::SlotTaken => "slot_taken",
            EngineError::NotOwner { .. } => "not_owner",
            EngineError::InvalidParticipant(_) => "invalid_participant",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::CancellationCutoff { .. } => "cancellation_cutoff",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Busy => "busy",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Wal(_) => "wal",
        }
    }

    /// Coarse grouping used for SQLSTATE mapping.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::DurationOutOfBounds { .. }
            | EngineError::InThePast
            | EngineError::TooFarInAdvance { .. }
            | EngineError::InvalidParticipant(_)
            | EngineError::InvalidRequest(_)
            | EngineError::CancellationCutoff { .. }
            | EngineError::AlreadyCancelled(_) => ErrorClass::Validation,
            EngineError::ResourceInactive(_)
            | EngineError::OutOfWindow { .. }
            | EngineError::PartiallyOutOfWindow { .. }
            | EngineError::DuringClosure { .. }
            | EngineError::Conflict(_)
            | EngineError::SlotTaken
            | EngineError::AlreadyExists(_) => ErrorClass::Unavailable,
            EngineError::NotOwner { .. } => ErrorClass::Forbidden,
            EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::Busy => ErrorClass::Busy,
            EngineError::LimitExceeded(_) => ErrorClass::Limit,
            EngineError::Wal(_) => ErrorClass::Storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Unavailable,
    Forbidden,
    NotFound,
    Busy,
    Limit,
    Storage,
}
