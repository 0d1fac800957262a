use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::timeutil::{day_bounds, round_to_slot};

use super::{Engine, EngineError};

// ── Day views ─────────────────────────────────────────────────────

/// Spans of the non-cancelled bookings that start inside `day`, by start.
///
/// A booking that began the previous evening is not included even if it
/// runs past midnight; a booking starting late today may end tomorrow.
pub fn booked_intervals_in(rs: &InstrumentState, day: &Span) -> Vec<Span> {
    rs.starting_within(day)
        .filter(|b| !b.is_cancelled())
        .map(|b| b.span)
        .collect()
}

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

/// `base` minus `to_remove`. Both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// One cell of a day grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub span: Span,
    pub booked: bool,
}

/// Cut `day` into `slot_minutes` cells aligned on slot boundaries and mark
/// those touched by any booked interval.
pub fn slot_grid(day: &Span, booked: &[Span], slot_minutes: i64) -> Vec<Slot> {
    let mut slots = Vec::new();
    let mut start = day.start;
    while start < day.end {
        // next boundary strictly after `start`
        let end = round_to_slot(start + 1, slot_minutes).min(day.end);
        let span = Span::new(start, end);
        let taken = booked.iter().any(|b| b.overlaps(&span));
        slots.push(Slot { span, booked: taken });
        start = end;
    }
    slots
}

impl Engine {
    fn day_window(&self, date: NaiveDate) -> Result<Span, EngineError> {
        day_bounds(date, self.policy.timezone)
            .ok_or_else(|| EngineError::validation(format!("no such local day: {date}")))
    }

    /// Booked spans of an instrument on a local calendar day. Advisory:
    /// overlapping them is allowed unless the overlap policy says otherwise.
    pub async fn booked_intervals(
        &self,
        instrument_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let day = self.day_window(date)?;
        let rs = self
            .get_instrument_state(&instrument_id)
            .ok_or(EngineError::NotFound(instrument_id))?;
        let guard = rs.read().await;
        Ok(booked_intervals_in(&guard, &day))
    }

    /// The local day minus everything booked on it.
    pub async fn free_windows(
        &self,
        instrument_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let day = self.day_window(date)?;
        let booked = self.booked_intervals(instrument_id, date).await?;
        Ok(subtract_intervals(&[day], &merge_overlapping(&booked)))
    }

    /// Slot grid for a booking form, using the configured slot length.
    pub async fn day_slots(
        &self,
        instrument_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let day = self.day_window(date)?;
        let booked = self.booked_intervals(instrument_id, date).await?;
        Ok(slot_grid(&day, &merge_overlapping(&booked), self.policy.slot_minutes))
    }
}
