use chrono::{DateTime, NaiveDate};

use crate::model::*;

use super::EngineError;
use super::conflict::admit_facility;

// ── Weekly windows ───────────────────────────────────────────────

fn local_date(local_day_start: Ms) -> Result<NaiveDate, EngineError> {
    DateTime::from_timestamp_millis(local_day_start)
        .map(|dt| dt.date_naive())
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))
}

/// Check that `span` is covered by the facility's weekly windows.
///
/// The span is shifted into facility-local time and cut at each local
/// midnight; every per-day segment must lie inside the union of the windows
/// that apply on that date. A day whose windows don't touch the segment at all
/// reports `OutOfWindow`; a day that covers only part of it reports
/// `PartiallyOutOfWindow`.
pub fn check_windows(
    windows: &[AvailabilityWindow],
    utc_offset_ms: Ms,
    span: &Span,
) -> Result<(), EngineError> {
    let local = Span::new(span.start + utc_offset_ms, span.end + utc_offset_ms);
    let mut day_start = local.start.div_euclid(DAY_MS) * DAY_MS;

    while day_start < local.end {
        let date = local_date(day_start)?;
        let segment = Span::new(
            local.start.max(day_start) - day_start,
            local.end.min(day_start + DAY_MS) - day_start,
        );

        let mut open: Vec<Span> = windows
            .iter()
            .filter(|w| w.applies_on(date))
            .map(AvailabilityWindow::day_span)
            .collect();
        open.sort_by_key(|s| s.start);
        let open = merge_overlapping(&open);

        let uncovered = subtract_intervals(&[segment], &open);
        if uncovered.first() == Some(&segment) {
            return Err(EngineError::OutOfWindow { date });
        }
        if !uncovered.is_empty() {
            return Err(EngineError::PartiallyOutOfWindow { date });
        }
        day_start += DAY_MS;
    }
    Ok(())
}

/// Absolute open time inside `range`: union of all applicable windows, merged.
pub fn open_spans(
    windows: &[AvailabilityWindow],
    utc_offset_ms: Ms,
    range: &Span,
) -> Result<Vec<Span>, EngineError> {
    let mut spans = Vec::new();
    let local_start = range.start + utc_offset_ms;
    let local_end = range.end + utc_offset_ms;
    let mut day_start = local_start.div_euclid(DAY_MS) * DAY_MS;

    while day_start < local_end {
        let date = local_date(day_start)?;
        for window in windows.iter().filter(|w| w.applies_on(date)) {
            let ds = window.day_span();
            let start = (day_start + ds.start - utc_offset_ms).max(range.start);
            let end = (day_start + ds.end - utc_offset_ms).min(range.end);
            if start < end {
                spans.push(Span::new(start, end));
            }
        }
        day_start += DAY_MS;
    }
    spans.sort_by_key(|s| s.start);
    Ok(merge_overlapping(&spans))
}

// ── Slot enumeration ─────────────────────────────────────────────

/// A slot listing over one facility. `iter()` may be called repeatedly; each
/// call starts a fresh lazy walk over the candidate starts.
///
/// Candidates sit on a granularity grid anchored at each local midnight and
/// are only tried inside the facility's open spans, so closed nights cost
/// nothing.
pub struct SlotQuery<'a> {
    facility: &'a Facility,
    duration: Ms,
    now: Ms,
    open: Vec<Span>,
}

impl<'a> SlotQuery<'a> {
    pub fn new(facility: &'a Facility, range: Span, duration: Ms, now: Ms) -> Result<Self, EngineError> {
        let open = open_spans(&facility.windows, facility.policy.utc_offset_ms(), &range)?;
        Ok(Self {
            facility,
            duration,
            now,
            open,
        })
    }

    /// First grid point at or after `t`.
    fn align(&self, t: Ms) -> Ms {
        let step = self.step();
        let offset = self.facility.policy.utc_offset_ms();
        let local = t + offset;
        let midnight = local.div_euclid(DAY_MS) * DAY_MS;
        let into_day = local - midnight;
        midnight + (into_day + step - 1).div_euclid(step) * step - offset
    }

    fn step(&self) -> Ms {
        self.facility.policy.granularity.max(MINUTE_MS)
    }

    pub fn iter(&self) -> Slots<'_, 'a> {
        Slots {
            query: self,
            span: 0,
            cursor: Ms::MIN,
        }
    }
}

pub struct Slots<'q, 'a> {
    query: &'q SlotQuery<'a>,
    /// Index into the open spans.
    span: usize,
    cursor: Ms,
}

impl Iterator for Slots<'_, '_> {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        let q = self.query;
        loop {
            let open = q.open.get(self.span)?;
            if self.cursor < open.start {
                self.cursor = q.align(open.start);
            }
            let candidate = Span::new(self.cursor, self.cursor + q.duration);
            if !open.contains_span(&candidate) {
                self.span += 1;
                continue;
            }
            self.cursor += q.step();
            if admit_facility(q.facility, &candidate, q.now).is_ok() {
                return Some(candidate);
            }
        }
    }
}

// ── Interval algebra ─────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
