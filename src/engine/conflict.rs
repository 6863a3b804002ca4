use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::availability::check_windows;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_identity(who: &str) -> Result<(), EngineError> {
    if who.trim().is_empty() {
        return Err(EngineError::InvalidParticipant("empty identity".into()));
    }
    if who.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::LimitExceeded("identity too long"));
    }
    Ok(())
}

/// Duration bounds, past, and booking horizon.
pub(crate) fn check_policy(policy: &BookingPolicy, span: &Span, now: Ms) -> Result<(), EngineError> {
    let duration = span.duration_ms();
    if duration < policy.min_duration || policy.max_duration.is_some_and(|max| duration > max) {
        return Err(EngineError::DurationOutOfBounds {
            duration,
            min: policy.min_duration,
            max: policy.max_duration,
        });
    }
    if span.start < now {
        return Err(EngineError::InThePast);
    }
    if let Some(horizon) = policy.advance_horizon
        && span.start > now.saturating_add(horizon)
    {
        return Err(EngineError::TooFarInAdvance { horizon });
    }
    Ok(())
}

/// Closures block the requested time itself; the buffer does not apply.
pub(crate) fn check_no_closure(facility: &Facility, span: &Span) -> Result<(), EngineError> {
    let right_bound = facility.closures.partition_point(|c| c.span.start < span.end);
    match facility.closures[..right_bound]
        .iter()
        .find(|c| c.span.overlaps(span))
    {
        Some(c) => Err(EngineError::DuringClosure {
            id: c.id,
            reason: c.reason.clone(),
        }),
        None => Ok(()),
    }
}

/// A booking conflicts when it falls within `buffer` of an existing one on
/// either side. Expanding the candidate by the buffer is equivalent to
/// expanding every existing booking.
pub(crate) fn check_no_conflict(facility: &Facility, span: &Span) -> Result<(), EngineError> {
    let search = span.expand(facility.policy.buffer);
    match facility.overlapping(&search).next() {
        Some(existing) => Err(EngineError::Conflict(existing.reservation_id)),
        None => Ok(()),
    }
}

/// Full admission check for one facility interval, in reporting order:
/// policy, weekly windows, closures, existing bookings.
pub(crate) fn admit_facility(facility: &Facility, span: &Span, now: Ms) -> Result<(), EngineError> {
    check_policy(&facility.policy, span, now)?;
    check_windows(&facility.windows, facility.policy.utc_offset_ms(), span)?;
    check_no_closure(facility, span)?;
    check_no_conflict(facility, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use ulid::Ulid;

    const M: Ms = MINUTE_MS;
    const MONDAY: Ms = 1_767_571_200_000;

    fn open_all_monday() -> Facility {
        let mut f = Facility::new(BookingPolicy {
            min_duration: 30 * M,
            max_duration: Some(4 * HOUR_MS),
            buffer: 15 * M,
            ..BookingPolicy::default()
        });
        f.windows.push(AvailabilityWindow {
            id: Ulid::new(),
            weekday: Weekday::Mon,
            start_minute: 0,
            end_minute: MINUTES_PER_DAY,
            effective_from: None,
            effective_until: None,
        });
        f
    }

    fn book(f: &mut Facility, start: Ms, end: Ms) -> Ulid {
        let id = Ulid::new();
        f.insert_booking(Booking {
            reservation_id: id,
            span: Span::new(start, end),
        });
        id
    }

    #[test]
    fn buffer_blocks_both_sides() {
        let mut f = open_all_monday();
        let existing = book(&mut f, MONDAY + 10 * HOUR_MS, MONDAY + 11 * HOUR_MS);

        // ends 10 minutes before the existing booking
        let before = Span::new(MONDAY + 9 * HOUR_MS, MONDAY + 9 * HOUR_MS + 50 * M);
        assert!(matches!(check_no_conflict(&f, &before), Err(EngineError::Conflict(id)) if id == existing));

        // starts 10 minutes after it ends
        let after = Span::new(MONDAY + 11 * HOUR_MS + 10 * M, MONDAY + 12 * HOUR_MS);
        assert!(check_no_conflict(&f, &after).is_err());

        // exactly one buffer away is fine
        let clear = Span::new(MONDAY + 11 * HOUR_MS + 15 * M, MONDAY + 12 * HOUR_MS);
        assert!(check_no_conflict(&f, &clear).is_ok());
    }

    #[test]
    fn zero_buffer_allows_back_to_back() {
        let mut f = open_all_monday();
        f.policy.buffer = 0;
        book(&mut f, MONDAY + 10 * HOUR_MS, MONDAY + 11 * HOUR_MS);
        let next = Span::new(MONDAY + 11 * HOUR_MS, MONDAY + 12 * HOUR_MS);
        assert!(check_no_conflict(&f, &next).is_ok());
    }

    #[test]
    fn closure_ignores_buffer() {
        let mut f = open_all_monday();
        f.insert_closure(Closure {
            id: Ulid::new(),
            span: Span::new(MONDAY + 12 * HOUR_MS, MONDAY + 13 * HOUR_MS),
            reason: Some("cleaning".into()),
        });
        let adjacent = Span::new(MONDAY + 11 * HOUR_MS, MONDAY + 12 * HOUR_MS);
        assert!(check_no_closure(&f, &adjacent).is_ok());
        let inside = Span::new(MONDAY + 12 * HOUR_MS + 30 * M, MONDAY + 14 * HOUR_MS);
        assert!(matches!(
            check_no_closure(&f, &inside),
            Err(EngineError::DuringClosure { reason: Some(r), .. }) if r == "cleaning"
        ));
    }

    #[test]
    fn policy_bounds() {
        let f = open_all_monday();
        let now = MONDAY;
        let short = Span::new(MONDAY + HOUR_MS, MONDAY + HOUR_MS + 10 * M);
        assert!(matches!(
            check_policy(&f.policy, &short, now),
            Err(EngineError::DurationOutOfBounds { duration, .. }) if duration == 10 * M
        ));
        let long = Span::new(MONDAY + HOUR_MS, MONDAY + 6 * HOUR_MS);
        assert!(matches!(check_policy(&f.policy, &long, now), Err(EngineError::DurationOutOfBounds { .. })));
        let past = Span::new(MONDAY - HOUR_MS, MONDAY);
        assert!(matches!(check_policy(&f.policy, &past, now), Err(EngineError::InThePast)));
    }

    #[test]
    fn horizon_enforced() {
        let mut f = open_all_monday();
        f.policy.advance_horizon = Some(DAY_MS);
        let far = Span::new(MONDAY + 2 * DAY_MS, MONDAY + 2 * DAY_MS + HOUR_MS);
        assert!(matches!(
            check_policy(&f.policy, &far, MONDAY),
            Err(EngineError::TooFarInAdvance { horizon }) if horizon == DAY_MS
        ));
        // Policies written before the horizon cap still evaluate.
        f.policy.advance_horizon = Some(Ms::MAX);
        assert!(check_policy(&f.policy, &far, MONDAY).is_ok());
    }

    #[test]
    fn admit_reports_window_before_conflict() {
        let mut f = open_all_monday();
        book(&mut f, MONDAY + 23 * HOUR_MS, MONDAY + 24 * HOUR_MS);
        // crosses into Tuesday, which has no window
        let span = Span::new(MONDAY + 23 * HOUR_MS, MONDAY + 25 * HOUR_MS);
        assert!(matches!(admit_facility(&f, &span, MONDAY), Err(EngineError::OutOfWindow { .. })));
    }

    #[test]
    fn identity_validation() {
        assert!(validate_identity("ana").is_ok());
        assert!(matches!(validate_identity("  "), Err(EngineError::InvalidParticipant(_))));
        assert!(matches!(
            validate_identity(&"x".repeat(MAX_IDENTITY_LEN + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn span_limits() {
        assert!(validate_span(&Span::new(-10, 10)).is_err());
        assert!(validate_span(&Span::new(0, MAX_SPAN_DURATION_MS + 1)).is_err());
        assert!(validate_span(&Span::new(MONDAY, MONDAY + HOUR_MS)).is_ok());
    }
}
