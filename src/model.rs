use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied times.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS as f64
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Same length, moved forward by `delta`.
    pub fn shifted(&self, delta: Ms) -> Span {
        Span {
            start: self.start + delta,
            end: self.end + delta,
        }
    }
}

// ── Status axes ──────────────────────────────────────────────────

/// Administrative decision on a booking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Pending,
    Approved,
    Denied,
}

/// How the booked session itself is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    NotStarted,
    InProgress,
    Completed,
    Delayed,
    Cancelled,
}

/// The flat status string used by the external interface.
///
/// Mixes both axes. `Not-Started` and `confirmed` both describe an approved
/// booking that has not begun, so reading the axes back always yields
/// `confirmed` for that pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "confirmed")]
    Confirmed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "Not-Started")]
    NotStarted,
    #[serde(rename = "In-Progress")]
    InProgress,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "Delayed")]
    Delayed,
}

impl BookingStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::NotStarted => "Not-Started",
            Self::InProgress => "In-Progress",
            Self::Completed => "Completed",
            Self::Delayed => "Delayed",
        }
    }

    pub fn from_axes(approval: Approval, progress: Progress) -> Self {
        if approval == Approval::Denied || progress == Progress::Cancelled {
            return Self::Cancelled;
        }
        match progress {
            Progress::InProgress => Self::InProgress,
            Progress::Completed => Self::Completed,
            Progress::Delayed => Self::Delayed,
            _ => match approval {
                Approval::Pending => Self::Pending,
                _ => Self::Confirmed,
            },
        }
    }

    /// Resulting axes when this flat status is written over `(approval, progress)`.
    ///
    /// Every write reads back as itself (`Not-Started` reads back as
    /// `confirmed`). `pending` and `confirmed` reset progress. `cancelled` on
    /// a pending request is a denial; on anything else it cancels the
    /// session. Progress values re-approve a denied booking, and
    /// `Not-Started` also approves a pending one.
    pub fn apply(self, approval: Approval, progress: Progress) -> (Approval, Progress) {
        let reapproved = if approval == Approval::Denied {
            Approval::Approved
        } else {
            approval
        };
        match self {
            Self::Pending => (Approval::Pending, Progress::NotStarted),
            Self::Confirmed | Self::NotStarted => (Approval::Approved, Progress::NotStarted),
            Self::Cancelled if approval == Approval::Pending => (Approval::Denied, progress),
            Self::Cancelled if approval == Approval::Denied => (approval, progress),
            Self::Cancelled => (approval, Progress::Cancelled),
            Self::InProgress => (reapproved, Progress::InProgress),
            Self::Completed => (reapproved, Progress::Completed),
            Self::Delayed => (reapproved, Progress::Delayed),
        }
    }

    /// What `from_axes` yields after writing this status.
    pub const fn reads_back_as(&self) -> Self {
        match self {
            Self::NotStarted => Self::Confirmed,
            other => *other,
        }
    }

    pub const fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::NotStarted | Self::InProgress | Self::Completed | Self::Delayed
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "Not-Started" => Ok(Self::NotStarted),
            "In-Progress" => Ok(Self::InProgress),
            "Completed" => Ok(Self::Completed),
            "Delayed" => Ok(Self::Delayed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    Available,
    Maintenance,
    InUse,
    Offline,
}

impl InstrumentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Maintenance => "maintenance",
            Self::InUse => "in_use",
            Self::Offline => "offline",
        }
    }
}

impl FromStr for InstrumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "maintenance" => Ok(Self::Maintenance),
            "in_use" => Ok(Self::InUse),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown instrument status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceEntry {
    pub date: NaiveDate,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: Ulid,
    pub name: String,
    pub kind: Option<String>,
    pub model: Option<String>,
    pub location: String,
    pub status: InstrumentStatus,
    /// Advisory only, never checked against new bookings.
    pub calibration_due: Option<NaiveDate>,
    pub maintenance_history: Vec<MaintenanceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Ulid,
    pub user_id: Ulid,
    pub user_name: String,
    pub content: String,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub instrument_id: Ulid,
    pub instrument_name: String,
    pub user_id: Ulid,
    pub user_name: String,
    pub span: Span,
    pub purpose: String,
    pub details: Option<String>,
    pub approval: Approval,
    pub progress: Progress,
    pub comments: Vec<Comment>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every persisted change.
    pub version: u64,
}

impl Booking {
    pub fn status(&self) -> BookingStatus {
        BookingStatus::from_axes(self.approval, self.progress)
    }

    pub fn is_cancelled(&self) -> bool {
        self.approval == Approval::Denied || self.progress == Progress::Cancelled
    }

    /// Fields whose change is worth telling the owner about. Comments are
    /// not compared.
    pub fn differs_materially(&self, other: &Booking) -> bool {
        self.status() != other.status()
            || self.span != other.span
            || self.purpose != other.purpose
            || self.details != other.details
            || self.instrument_id != other.instrument_id
    }
}

/// One instrument and every booking on it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    pub instrument: Instrument,
    pub bookings: Vec<Booking>,
}

impl InstrumentState {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.instrument.id
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Replace an existing booking (or insert it) keeping the order.
    pub fn upsert_booking(&mut self, booking: Booking) {
        self.remove_booking(booking.id);
        self.insert_booking(booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Bookings whose start lies inside the window.
    pub fn starting_within(&self, window: &Span) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.span.start < window.start);
        let hi = self.bookings.partition_point(|b| b.span.start < window.end);
        self.bookings[lo..hi].iter()
    }
}

/// WAL record format. Every state change is exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    InstrumentCreated {
        instrument: Instrument,
    },
    InstrumentUpdated {
        instrument: Instrument,
    },
    InstrumentDeleted {
        id: Ulid,
    },
    MaintenanceLogged {
        instrument_id: Ulid,
        entry: MaintenanceEntry,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement. `from_instrument` differs from
    /// `booking.instrument_id` when the booking moved.
    BookingUpdated {
        booking: Booking,
        from_instrument: Ulid,
    },
    BookingDeleted {
        id: Ulid,
        instrument_id: Ulid,
    },
    /// One record for the whole bulk delay so it replays all or nothing.
    BookingsShifted {
        ids: Vec<Ulid>,
        delta: Ms,
        at: Ms,
    },
    CommentAdded {
        booking_id: Ulid,
        comment: Comment,
    },
    CommentDeleted {
        booking_id: Ulid,
        comment_id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_at(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            instrument_id: Ulid::new(),
            instrument_name: "NMR".into(),
            user_id: Ulid::new(),
            user_name: "Ada".into(),
            span: Span::new(start, end),
            purpose: "run".into(),
            details: None,
            approval: Approval::Approved,
            progress: Progress::NotStarted,
            comments: Vec::new(),
            created_at: 0,
            updated_at: 0,
            version: 1,
        }
    }

    fn state() -> InstrumentState {
        InstrumentState::new(Instrument {
            id: Ulid::new(),
            name: "NMR".into(),
            kind: None,
            model: None,
            location: "B12".into(),
            status: InstrumentStatus::Available,
            calibration_due: None,
            maintenance_history: Vec::new(),
        })
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(!s.contains_instant(200)); // half-open
        assert_eq!(s.shifted(50), Span::new(150, 250));
        assert!(Span::try_new(200, 200).is_none());
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.overlaps(&Span::new(150, 250)));
        assert!(!a.overlaps(&Span::new(200, 300)));
    }

    #[test]
    fn legacy_status_roundtrips_through_axes() {
        assert_eq!(
            BookingStatus::from_axes(Approval::Pending, Progress::NotStarted),
            BookingStatus::Pending
        );
        assert_eq!(
            BookingStatus::from_axes(Approval::Approved, Progress::NotStarted),
            BookingStatus::Confirmed
        );
        assert_eq!(
            BookingStatus::from_axes(Approval::Denied, Progress::NotStarted),
            BookingStatus::Cancelled
        );
        assert_eq!(
            BookingStatus::from_axes(Approval::Approved, Progress::Delayed),
            BookingStatus::Delayed
        );
        for s in ["pending", "confirmed", "cancelled", "Not-Started", "In-Progress", "Completed", "Delayed"] {
            assert_eq!(s.parse::<BookingStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn cancelling_pending_is_denial() {
        let (a, p) = BookingStatus::Cancelled.apply(Approval::Pending, Progress::NotStarted);
        assert_eq!((a, p), (Approval::Denied, Progress::NotStarted));

        let (a, p) = BookingStatus::Cancelled.apply(Approval::Approved, Progress::InProgress);
        assert_eq!((a, p), (Approval::Approved, Progress::Cancelled));
    }

    #[test]
    fn confirming_revives_cancelled_progress() {
        let (a, p) = BookingStatus::Confirmed.apply(Approval::Approved, Progress::Cancelled);
        assert_eq!((a, p), (Approval::Approved, Progress::NotStarted));
    }

    #[test]
    fn every_flat_write_reads_back() {
        let approvals = [Approval::Pending, Approval::Approved, Approval::Denied];
        let progresses = [
            Progress::NotStarted,
            Progress::InProgress,
            Progress::Completed,
            Progress::Delayed,
            Progress::Cancelled,
        ];
        let statuses = [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Cancelled,
            BookingStatus::NotStarted,
            BookingStatus::InProgress,
            BookingStatus::Completed,
            BookingStatus::Delayed,
        ];
        for a in approvals {
            for p in progresses {
                for to in statuses {
                    let (na, np) = to.apply(a, p);
                    assert_eq!(
                        BookingStatus::from_axes(na, np),
                        to.reads_back_as(),
                        "{to} over ({a:?}, {p:?})"
                    );
                }
            }
        }
    }

    #[test]
    fn progress_write_reapproves_denied() {
        let (a, p) = BookingStatus::InProgress.apply(Approval::Denied, Progress::NotStarted);
        assert_eq!((a, p), (Approval::Approved, Progress::InProgress));
        let (a, p) = BookingStatus::Pending.apply(Approval::Approved, Progress::Completed);
        assert_eq!((a, p), (Approval::Pending, Progress::NotStarted));
    }

    #[test]
    fn comment_changes_are_not_material() {
        let a = booking_at(0, 100);
        let mut b = a.clone();
        b.comments.push(Comment {
            id: Ulid::new(),
            user_id: Ulid::new(),
            user_name: "Bo".into(),
            content: "hi".into(),
            created_at: 5,
        });
        b.version += 1;
        assert!(!a.differs_materially(&b));
        b.purpose = "other".into();
        assert!(a.differs_materially(&b));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut rs = state();
        rs.insert_booking(booking_at(300, 400));
        rs.insert_booking(booking_at(100, 200));
        rs.insert_booking(booking_at(200, 300));
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        let mut moved = rs.bookings[0].clone();
        moved.span = Span::new(500, 600);
        rs.upsert_booking(moved);
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![200, 300, 500]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = state();
        rs.insert_booking(booking_at(100, 200));
        rs.insert_booking(booking_at(450, 600));
        rs.insert_booking(booking_at(1000, 1100));
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
        assert_eq!(rs.overlapping(&Span::new(200, 450)).count(), 0);
    }

    #[test]
    fn starting_within_uses_start_only() {
        let mut rs = state();
        rs.insert_booking(booking_at(50, 150)); // starts before window
        rs.insert_booking(booking_at(100, 200));
        rs.insert_booking(booking_at(199, 400));
        rs.insert_booking(booking_at(200, 300)); // starts at window end
        let hits: Vec<_> = rs.starting_within(&Span::new(100, 200)).collect();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = state();
        rs.insert_booking(booking_at(100, 200));
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.bookings.len(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking_at(100, 200),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
