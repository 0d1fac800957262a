//! Pure time helpers shared by the calendar views and the engine.
//!
//! Everything inside the engine is Unix milliseconds; calendar questions
//! (which day, which ISO week) are answered in a configured time zone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, Span, MINUTE_MS};

pub const DEFAULT_SLOT_MINUTES: i64 = 30;

/// `start + duration_minutes`. No rounding.
pub fn derive_end(start: Ms, duration_minutes: f64) -> Ms {
    start + (duration_minutes * MINUTE_MS as f64).round() as Ms
}

/// Round up to the next slot boundary. Already-aligned times are unchanged.
pub fn round_to_slot(time: Ms, slot_minutes: i64) -> Ms {
    let slot = slot_minutes.max(1) * MINUTE_MS;
    let rem = time.rem_euclid(slot);
    if rem == 0 { time } else { time - rem + slot }
}

/// Half-open overlap: touching intervals do not overlap.
pub fn intervals_overlap(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

pub fn hours_between(start: Ms, end: Ms) -> f64 {
    (end - start) as f64 / 3_600_000.0
}

pub fn parse_iso(s: &str) -> Option<Ms> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

pub fn format_iso(ms: Ms) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => ms.to_string(),
    }
}

pub fn local_date(ms: Ms, tz: Tz) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.with_timezone(&tz).date_naive())
}

/// Local-day window `[00:00, next day 00:00)` of `date` in `tz`.
///
/// Days that start inside a DST gap begin at the first valid instant.
pub fn day_bounds(date: NaiveDate, tz: Tz) -> Option<Span> {
    let start = local_midnight(date, tz)?;
    let end = local_midnight(date.succ_opt()?, tz)?;
    Span::try_new(start, end)
}

fn local_midnight(date: NaiveDate, tz: Tz) -> Option<Ms> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    let mut candidate = naive;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return Some(dt.timestamp_millis());
        }
        candidate += Duration::minutes(30);
    }
    None
}

/// ISO week-numbering `(year, week)` of the local date of `ms`.
pub fn iso_week(ms: Ms, tz: Tz) -> Option<(i32, u32)> {
    let week = local_date(ms, tz)?.iso_week();
    Some((week.year(), week.week()))
}

pub fn same_day(a: Ms, b: Ms, tz: Tz) -> bool {
    match (local_date(a, tz), local_date(b, tz)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// `09:00–10:30` on one day, full timestamps otherwise.
pub fn format_range(span: &Span, tz: Tz) -> String {
    let (Some(start), Some(end)) = (
        Utc.timestamp_millis_opt(span.start).single(),
        Utc.timestamp_millis_opt(span.end).single(),
    ) else {
        return format!("{}–{}", span.start, span.end);
    };
    let (start, end) = (start.with_timezone(&tz), end.with_timezone(&tz));
    if start.date_naive() == end.date_naive() {
        format!("{} {}–{}", start.format("%Y-%m-%d"), start.format("%H:%M"), end.format("%H:%M"))
    } else {
        format!("{} – {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"))
    }
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> Ms {
        parse_iso(s).unwrap()
    }

    #[test]
    fn derive_end_adds_minutes_exactly() {
        let start = at("2024-01-10T09:00:00Z");
        assert_eq!(derive_end(start, 150.0), at("2024-01-10T11:30:00Z"));
        assert_eq!(derive_end(start, 7.0), at("2024-01-10T09:07:00Z"));
    }

    #[test]
    fn round_to_slot_rounds_up() {
        assert_eq!(
            round_to_slot(at("2024-01-10T09:01:00Z"), 30),
            at("2024-01-10T09:30:00Z")
        );
        assert_eq!(
            round_to_slot(at("2024-01-10T09:30:00Z"), 30),
            at("2024-01-10T09:30:00Z")
        );
        assert_eq!(
            round_to_slot(at("2024-01-10T23:45:00Z"), 30),
            at("2024-01-11T00:00:00Z")
        );
    }

    #[test]
    fn overlap_excludes_touching() {
        let nine = at("2024-01-10T09:00:00Z");
        let ten = at("2024-01-10T10:00:00Z");
        let eleven = at("2024-01-10T11:00:00Z");
        assert!(!intervals_overlap(nine, ten, ten, eleven));
        assert!(intervals_overlap(nine, ten + 1, ten, eleven));
    }

    #[test]
    fn iso_roundtrip() {
        let ms = at("2024-01-10T09:00:00Z");
        assert_eq!(format_iso(ms), "2024-01-10T09:00:00Z");
        assert_eq!(parse_iso("2024-01-10T10:00:00+01:00"), Some(ms));
        assert_eq!(parse_iso("yesterday"), None);
    }

    #[test]
    fn day_bounds_in_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let day = day_bounds(date, Tz::UTC).unwrap();
        assert_eq!(day.start, at("2024-01-10T00:00:00Z"));
        assert_eq!(day.end, at("2024-01-11T00:00:00Z"));
    }

    #[test]
    fn day_bounds_follow_zone_offset() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let day = day_bounds(date, chrono_tz::Europe::Berlin).unwrap();
        assert_eq!(day.start, at("2024-01-09T23:00:00Z"));
        assert_eq!(day.duration_ms(), 24 * 3_600_000);
    }

    #[test]
    fn dst_day_is_short() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let day = day_bounds(date, chrono_tz::Europe::Berlin).unwrap();
        assert_eq!(day.duration_ms(), 23 * 3_600_000);
    }

    #[test]
    fn iso_week_crosses_year() {
        // 2024-12-30 is Monday of ISO week 1 of 2025.
        assert_eq!(iso_week(at("2024-12-30T12:00:00Z"), Tz::UTC), Some((2025, 1)));
        assert_eq!(iso_week(at("2024-01-10T12:00:00Z"), Tz::UTC), Some((2024, 2)));
    }

    #[test]
    fn same_day_depends_on_zone() {
        let late = at("2024-01-10T23:30:00Z");
        let next = at("2024-01-11T00:30:00Z");
        assert!(!same_day(late, next, Tz::UTC));
        assert!(same_day(late, next, chrono_tz::Europe::Berlin));
    }

    #[test]
    fn format_range_single_day() {
        let span = Span::new(at("2024-01-10T09:00:00Z"), at("2024-01-10T10:30:00Z"));
        assert_eq!(format_range(&span, Tz::UTC), "2024-01-10 09:00–10:30");
    }
}
