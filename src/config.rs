use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::timeutil::DEFAULT_SLOT_MINUTES;

/// What happens when a booking lands on top of an approved one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Overlaps are only surfaced to the UI; admins decide.
    #[default]
    Permissive,
    /// An approved booking may not overlap another approved, non-cancelled
    /// booking of the same instrument. Pending requests are checked when
    /// they are approved.
    RejectApproved,
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permissive" => Ok(Self::Permissive),
            "reject_approved" => Ok(Self::RejectApproved),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    #[default]
    LastWriteWins,
    /// Updates must name the version they were based on.
    Strict,
}

impl FromStr for ConcurrencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown concurrency mode: {other}")),
        }
    }
}

/// The engine-facing part of the configuration.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub overlap: OverlapPolicy,
    pub concurrency: ConcurrencyMode,
    /// Calendar-day semantics for availability and statistics.
    pub timezone: Tz,
    pub slot_minutes: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            overlap: OverlapPolicy::default(),
            concurrency: ConcurrencyMode::default(),
            timezone: Tz::UTC,
            slot_minutes: DEFAULT_SLOT_MINUTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub policy: Policy,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// Flip overdue in-progress bookings to completed in the background.
    pub auto_complete: bool,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            policy: Policy::default(),
            compact_threshold: 1000,
            auto_complete: false,
            metrics_port: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key}={raw}");
            None
        }
    }
}

impl Config {
    /// Defaults overridden by `LABSLOT_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_dir: std::env::var("LABSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            policy: Policy {
                overlap: env_parse("LABSLOT_OVERLAP_POLICY").unwrap_or(d.policy.overlap),
                concurrency: env_parse("LABSLOT_CONCURRENCY").unwrap_or(d.policy.concurrency),
                timezone: env_parse("LABSLOT_TIMEZONE").unwrap_or(d.policy.timezone),
                slot_minutes: env_parse::<i64>("LABSLOT_SLOT_MINUTES")
                    .filter(|m| *m > 0)
                    .unwrap_or(d.policy.slot_minutes),
            },
            compact_threshold: env_parse("LABSLOT_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            auto_complete: env_parse("LABSLOT_AUTO_COMPLETE").unwrap_or(d.auto_complete),
            metrics_port: env_parse("LABSLOT_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive_and_last_write_wins() {
        let c = Config::default();
        assert_eq!(c.policy.overlap, OverlapPolicy::Permissive);
        assert_eq!(c.policy.concurrency, ConcurrencyMode::LastWriteWins);
        assert_eq!(c.policy.slot_minutes, 30);
        assert!(!c.auto_complete);
        assert_eq!(c.wal_path(), PathBuf::from("./data/bookings.wal"));
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!("strict".parse::<ConcurrencyMode>(), Ok(ConcurrencyMode::Strict));
        assert_eq!(
            "reject_approved".parse::<OverlapPolicy>(),
            Ok(OverlapPolicy::RejectApproved)
        );
        assert!("sometimes".parse::<OverlapPolicy>().is_err());
        assert_eq!("Europe/Berlin".parse::<Tz>().unwrap(), chrono_tz::Europe::Berlin);
    }
}
