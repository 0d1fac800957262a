//! Booking length from sample throughput.
//!
//! `hours = ceil(((samples * minutes_per_sample + setup) / 60) * 2) / 2`.
//! Rounding happens once, at the hours step; the end time is derived from
//! the rounded value and never rounded again.

use serde::{Deserialize, Serialize};

/// Setup overhead added on top of the sample runtime.
///
/// The edit dialog and the quick-booking form historically use different
/// defaults; both are kept as named policies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SetupPolicy {
    /// 15 minutes.
    BookingEdit,
    /// No setup overhead.
    QuickBooking,
    Custom(f64),
}

impl SetupPolicy {
    pub fn minutes(&self) -> f64 {
        match self {
            Self::BookingEdit => 15.0,
            Self::QuickBooking => 0.0,
            Self::Custom(m) => m.max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub sample_count: u32,
    pub minutes_per_sample: f64,
}

const SAMPLES_KEY: &str = "samples=";
const PER_SAMPLE_KEY: &str = "minutes_per_sample=";

impl SampleMetadata {
    /// `None` unless both values are positive and finite.
    pub fn new(sample_count: u32, minutes_per_sample: f64) -> Option<Self> {
        (sample_count > 0 && minutes_per_sample.is_finite() && minutes_per_sample > 0.0).then_some(
            Self {
                sample_count,
                minutes_per_sample,
            },
        )
    }

    /// Parse raw form fields. Blank, non-numeric or non-positive input gives
    /// `None` so the caller keeps the manually entered duration.
    pub fn from_fields(sample_count: &str, minutes_per_sample: &str) -> Option<Self> {
        let count = sample_count.trim().parse::<u32>().ok()?;
        let per_sample = minutes_per_sample.trim().parse::<f64>().ok()?;
        Self::new(count, per_sample)
    }

    pub fn raw_minutes(&self, setup: SetupPolicy) -> f64 {
        self.sample_count as f64 * self.minutes_per_sample + setup.minutes()
    }

    /// Duration in hours, rounded up to the next half hour.
    pub fn derive_hours(&self, setup: SetupPolicy) -> f64 {
        round_up_half_hour(self.raw_minutes(setup) / 60.0)
    }

    /// Find the metadata line inside free-text booking details.
    pub fn extract(details: &str) -> Option<Self> {
        details.lines().find_map(|line| {
            let line = line.trim();
            let mut count = None;
            let mut per_sample = None;
            for part in line.split(';') {
                let part = part.trim();
                if let Some(v) = part.strip_prefix(SAMPLES_KEY) {
                    count = v.trim().parse::<u32>().ok();
                } else if let Some(v) = part.strip_prefix(PER_SAMPLE_KEY) {
                    per_sample = v.trim().parse::<f64>().ok();
                }
            }
            Self::new(count?, per_sample?)
        })
    }

    /// Write the metadata line into `details`, replacing a previous one.
    pub fn embed(&self, details: Option<&str>) -> String {
        let line = format!(
            "{SAMPLES_KEY}{}; {PER_SAMPLE_KEY}{}",
            self.sample_count, self.minutes_per_sample
        );
        let mut kept: Vec<&str> = details
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim_start().starts_with(SAMPLES_KEY))
            .collect();
        while kept.last().is_some_and(|l| l.trim().is_empty()) {
            kept.pop();
        }
        if kept.is_empty() {
            line
        } else {
            format!("{}\n{line}", kept.join("\n"))
        }
    }
}

pub fn round_up_half_hour(hours: f64) -> f64 {
    (hours * 2.0).ceil() / 2.0
}

/// Derived hours when the samples are usable, otherwise `current_hours`.
pub fn derive_or_keep(current_hours: f64, samples: Option<&SampleMetadata>, setup: SetupPolicy) -> f64 {
    samples.map_or(current_hours, |s| s.derive_hours(setup))
}
