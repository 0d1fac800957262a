//! Read-only rollups over an [`engine::Snapshot`](crate::engine::Snapshot).
//!
//! Every booking counts, cancelled ones included; hours are summed unrounded
//! and rounded to two decimals only in the final row.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Duration, NaiveDate};
use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::engine::Snapshot;
use crate::model::Booking;
use crate::timeutil::{iso_week, local_date};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRow {
    pub id: Ulid,
    pub name: String,
    pub booking_count: usize,
    pub total_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeekBucket {
    pub year: i32,
    pub week: u32,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    pub date: NaiveDate,
    /// `Mon`, `Tue`, ...
    pub label: String,
    pub count: usize,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn rollup<K, N>(bookings: &[Booking], key: K, name: N) -> Vec<UsageRow>
where
    K: Fn(&Booking) -> Ulid,
    N: Fn(&Booking) -> &str,
{
    let mut acc: HashMap<Ulid, (String, usize, f64)> = HashMap::new();
    for b in bookings {
        let entry = acc
            .entry(key(b))
            .or_insert_with(|| (name(b).to_string(), 0, 0.0));
        entry.1 += 1;
        entry.2 += b.span.hours();
    }
    let mut rows: Vec<UsageRow> = acc
        .into_iter()
        .map(|(id, (name, booking_count, hours))| UsageRow {
            id,
            name,
            booking_count,
            total_hours: round2(hours),
        })
        .collect();
    // ties broken by count then id so repeated runs agree
    rows.sort_by(|a, b| {
        b.total_hours
            .total_cmp(&a.total_hours)
            .then(b.booking_count.cmp(&a.booking_count))
            .then(a.id.cmp(&b.id))
    });
    rows
}

/// Per instrument, most used first.
pub fn instrument_usage(bookings: &[Booking]) -> Vec<UsageRow> {
    rollup(bookings, |b| b.instrument_id, |b| b.instrument_name.as_str())
}

/// Per user, most hours first.
pub fn user_bookings(bookings: &[Booking]) -> Vec<UsageRow> {
    rollup(bookings, |b| b.user_id, |b| b.user_name.as_str())
}

/// Booking counts per ISO week of the local start date, chronological.
pub fn weekly_usage_by_iso_week(bookings: &[Booking], tz: Tz) -> Vec<WeekBucket> {
    let mut weeks: BTreeMap<(i32, u32), usize> = BTreeMap::new();
    for b in bookings {
        if let Some(key) = iso_week(b.span.start, tz) {
            *weeks.entry(key).or_default() += 1;
        }
    }
    weeks
        .into_iter()
        .map(|((year, week), count)| WeekBucket { year, week, count })
        .collect()
}

/// Seven day buckets ending with `today`, oldest first, keyed by the local
/// start date.
pub fn weekly_usage_trailing_7_days(bookings: &[Booking], today: NaiveDate, tz: Tz) -> Vec<DayBucket> {
    let first = today - Duration::days(6);
    let mut buckets: Vec<DayBucket> = (0..7)
        .map(|i| {
            let date = first + Duration::days(i);
            DayBucket {
                date,
                label: date.weekday().to_string(),
                count: 0,
            }
        })
        .collect();
    for b in bookings {
        let Some(date) = local_date(b.span.start, tz) else {
            continue;
        };
        if date < first || date > today {
            continue;
        }
        let idx = (date - first).num_days() as usize;
        buckets[idx].count += 1;
    }
    buckets
}

pub fn total_bookings(bookings: &[Booking]) -> usize {
    bookings.len()
}

/// Everything a dashboard shows, from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub total_bookings: usize,
    pub instruments: Vec<UsageRow>,
    pub users: Vec<UsageRow>,
    pub by_iso_week: Vec<WeekBucket>,
    pub last_7_days: Vec<DayBucket>,
}

impl UsageReport {
    pub fn compute(snapshot: &Snapshot, today: NaiveDate, tz: Tz) -> Self {
        let bookings = &snapshot.bookings;
        Self {
            total_bookings: total_bookings(bookings),
            instruments: instrument_usage(bookings),
            users: user_bookings(bookings),
            by_iso_week: weekly_usage_by_iso_week(bookings, tz),
            last_7_days: weekly_usage_trailing_7_days(bookings, today, tz),
        }
    }
}
