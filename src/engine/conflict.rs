use crate::config::{ConcurrencyMode, OverlapPolicy};
use crate::identity::Actor;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// `end > start`, then range limits.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::validation("end must be after start"))?;
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn required_text(field: &str, value: &str, max_len: usize) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    if trimmed.len() > max_len {
        return Err(EngineError::LimitExceeded("text too long"));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn optional_text(value: Option<String>, max_len: usize) -> Result<Option<String>, EngineError> {
    match value {
        Some(v) if v.len() > max_len => Err(EngineError::LimitExceeded("text too long")),
        Some(v) if v.trim().is_empty() => Ok(None),
        other => Ok(other),
    }
}

pub(crate) fn require_admin(actor: &Actor, what: &'static str) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(what))
    }
}

pub(crate) fn require_owner_or_admin(actor: &Actor, booking: &Booking) -> Result<(), EngineError> {
    if actor.is_admin() || actor.id == booking.user_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden("only the owner or an admin may change a booking"))
    }
}

/// Status moves a non-admin owner may make through an edit.
pub(crate) fn check_owner_status_change(
    actor: &Actor,
    before: &Booking,
    to: BookingStatus,
) -> Result<(), EngineError> {
    if actor.is_admin() || before.status() == to {
        return Ok(());
    }
    match to {
        BookingStatus::Cancelled => Ok(()),
        s if s.is_progress() && before.is_cancelled() => {
            Err(EngineError::validation("booking is cancelled"))
        }
        // `Not-Started` on a pending request would approve it
        s if s.is_progress() && s.apply(before.approval, before.progress).0 == before.approval => {
            Ok(())
        }
        _ => Err(EngineError::Forbidden("only admins approve or deny bookings")),
    }
}

pub(crate) fn check_version(
    mode: ConcurrencyMode,
    current: &Booking,
    expected: Option<u64>,
) -> Result<(), EngineError> {
    match (mode, expected) {
        (ConcurrencyMode::LastWriteWins, _) => Ok(()),
        (ConcurrencyMode::Strict, None) => {
            Err(EngineError::validation("expected_version is required"))
        }
        (ConcurrencyMode::Strict, Some(v)) if v == current.version => Ok(()),
        (ConcurrencyMode::Strict, Some(_)) => Err(EngineError::Conflict(current.id)),
    }
}

/// Under `RejectApproved`, an approved booking may not overlap another
/// approved, non-cancelled booking on the same instrument. Pending requests
/// are checked when they get approved.
pub(crate) fn check_overlap(
    policy: OverlapPolicy,
    rs: &InstrumentState,
    booking: &Booking,
) -> Result<(), EngineError> {
    if policy == OverlapPolicy::Permissive
        || booking.approval != Approval::Approved
        || booking.is_cancelled()
    {
        return Ok(());
    }
    let blocker = rs.overlapping(&booking.span).find(|other| {
        other.id != booking.id && other.approval == Approval::Approved && !other.is_cancelled()
    });
    match blocker {
        Some(other) => Err(EngineError::Conflict(other.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use ulid::Ulid;

    const BASE: Ms = 1_704_067_200_000; // 2024-01-01T00:00Z

    fn booking(start: Ms, end: Ms, approval: Approval) -> Booking {
        Booking {
            id: Ulid::new(),
            instrument_id: Ulid::new(),
            instrument_name: "XRD".into(),
            user_id: Ulid::new(),
            user_name: "Uma".into(),
            span: Span::new(start, end),
            purpose: "scan".into(),
            details: None,
            approval,
            progress: Progress::NotStarted,
            comments: Vec::new(),
            created_at: 0,
            updated_at: 0,
            version: 3,
        }
    }

    fn state_with(bookings: Vec<Booking>) -> InstrumentState {
        let mut rs = InstrumentState::new(Instrument {
            id: Ulid::new(),
            name: "XRD".into(),
            kind: None,
            model: None,
            location: "L1".into(),
            status: InstrumentStatus::Available,
            calibration_due: None,
            maintenance_history: Vec::new(),
        });
        for b in bookings {
            rs.insert_booking(b);
        }
        rs
    }

    #[test]
    fn span_must_be_forward_and_in_range() {
        assert!(matches!(checked_span(BASE, BASE), Err(EngineError::Validation(_))));
        assert!(matches!(checked_span(BASE + 1, BASE), Err(EngineError::Validation(_))));
        assert!(matches!(
            checked_span(0, HOUR_MS),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            checked_span(BASE, BASE + 40 * 24 * HOUR_MS),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(checked_span(BASE, BASE + HOUR_MS).unwrap().duration_ms(), HOUR_MS);
    }

    #[test]
    fn text_validation() {
        assert!(required_text("purpose", "   ", 10).is_err());
        assert_eq!(required_text("purpose", " XRD scan ", 20).unwrap(), "XRD scan");
        assert_eq!(optional_text(Some("  ".into()), 10).unwrap(), None);
        assert!(optional_text(Some("x".repeat(11)), 10).is_err());
    }

    #[test]
    fn strict_mode_rejects_stale_versions() {
        let b = booking(BASE, BASE + HOUR_MS, Approval::Pending);
        assert!(check_version(ConcurrencyMode::LastWriteWins, &b, Some(1)).is_ok());
        assert!(check_version(ConcurrencyMode::Strict, &b, Some(3)).is_ok());
        assert_eq!(
            check_version(ConcurrencyMode::Strict, &b, Some(2)),
            Err(EngineError::Conflict(b.id))
        );
        assert!(matches!(
            check_version(ConcurrencyMode::Strict, &b, None),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn owner_cannot_approve_own_request() {
        let b = booking(BASE, BASE + HOUR_MS, Approval::Pending);
        let owner = Actor::new(b.user_id, "Uma", Role::User);
        assert!(matches!(
            check_owner_status_change(&owner, &b, BookingStatus::Confirmed),
            Err(EngineError::Forbidden(_))
        ));
        assert!(check_owner_status_change(&owner, &b, BookingStatus::Cancelled).is_ok());
        assert!(check_owner_status_change(&owner, &b, BookingStatus::InProgress).is_ok());
        assert!(matches!(
            check_owner_status_change(&owner, &b, BookingStatus::NotStarted),
            Err(EngineError::Forbidden(_))
        ));
        let admin = Actor::new(Ulid::new(), "Ann", Role::Admin);
        assert!(check_owner_status_change(&admin, &b, BookingStatus::Confirmed).is_ok());
    }

    #[test]
    fn overlap_policy() {
        let approved = booking(BASE, BASE + HOUR_MS, Approval::Approved);
        let pending = booking(BASE + 2 * HOUR_MS, BASE + 3 * HOUR_MS, Approval::Pending);
        let rs = state_with(vec![approved.clone(), pending.clone()]);

        let clash = booking(BASE + HOUR_MS / 2, BASE + 2 * HOUR_MS, Approval::Approved);
        assert!(check_overlap(OverlapPolicy::Permissive, &rs, &clash).is_ok());
        assert_eq!(
            check_overlap(OverlapPolicy::RejectApproved, &rs, &clash),
            Err(EngineError::Conflict(approved.id))
        );

        // requests wait for approval before they are checked
        let request = booking(BASE + HOUR_MS / 2, BASE + 2 * HOUR_MS, Approval::Pending);
        assert!(check_overlap(OverlapPolicy::RejectApproved, &rs, &request).is_ok());

        // touching is fine, pending neighbours do not block
        let touching = booking(BASE + HOUR_MS, BASE + 5 * HOUR_MS / 2, Approval::Approved);
        assert!(check_overlap(OverlapPolicy::RejectApproved, &rs, &touching).is_ok());

        // a booking never blocks itself
        assert!(check_overlap(OverlapPolicy::RejectApproved, &rs, &approved).is_ok());
    }
}
