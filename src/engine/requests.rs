use chrono::NaiveDate;
use ulid::Ulid;

use crate::duration::{SampleMetadata, SetupPolicy, derive_or_keep};
use crate::model::{Approval, BookingStatus, Comment, InstrumentStatus, Ms};
use crate::timeutil::derive_end;

use super::EngineError;

/// Which form a booking came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFlow {
    /// Regular request; waits for admin approval.
    Request,
    /// Quick booking; confirmed immediately.
    Quick,
}

impl BookingFlow {
    pub fn initial_approval(&self) -> Approval {
        match self {
            Self::Request => Approval::Pending,
            Self::Quick => Approval::Approved,
        }
    }

    pub fn default_setup(&self) -> SetupPolicy {
        match self {
            Self::Request => SetupPolicy::BookingEdit,
            Self::Quick => SetupPolicy::QuickBooking,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Quick => "quick",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookingEnd {
    At(Ms),
    /// Manually entered hours, replaced by the sample-derived duration when
    /// the sample fields are usable.
    Duration {
        manual_hours: f64,
        samples: Option<SampleMetadata>,
        setup: Option<SetupPolicy>,
    },
}

impl BookingEnd {
    /// End timestamp plus the samples that produced it, if any.
    pub(super) fn resolve(
        &self,
        start: Ms,
        flow: BookingFlow,
    ) -> Result<(Ms, Option<SampleMetadata>), EngineError> {
        self.resolve_with(start, flow.default_setup(), None)
    }

    /// As [`resolve`](Self::resolve) for an edit: setup defaults to the edit
    /// dialog's policy, and without new sample fields the metadata stored in
    /// `stored_details` is used again.
    pub(super) fn resolve_edit(
        &self,
        start: Ms,
        stored_details: Option<&str>,
    ) -> Result<(Ms, Option<SampleMetadata>), EngineError> {
        let stored = stored_details.and_then(SampleMetadata::extract);
        self.resolve_with(start, SetupPolicy::BookingEdit, stored)
    }

    fn resolve_with(
        &self,
        start: Ms,
        default_setup: SetupPolicy,
        fallback: Option<SampleMetadata>,
    ) -> Result<(Ms, Option<SampleMetadata>), EngineError> {
        match self {
            BookingEnd::At(end) => Ok((*end, None)),
            BookingEnd::Duration {
                manual_hours,
                samples,
                setup,
            } => {
                let setup = setup.unwrap_or(default_setup);
                let samples = samples.or(fallback);
                let hours = derive_or_keep(*manual_hours, samples.as_ref(), setup);
                if !hours.is_finite() || hours <= 0.0 {
                    return Err(EngineError::validation("duration must be positive"));
                }
                Ok((derive_end(start, hours * 60.0), samples))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub instrument_id: Ulid,
    /// Booking on behalf of someone else; `None` books for the actor.
    pub user_id: Option<Ulid>,
    pub start: Ms,
    pub end: BookingEnd,
    pub purpose: String,
    pub details: Option<String>,
    pub flow: BookingFlow,
}

/// Partial edit of a booking. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingUpdate {
    /// Required under strict concurrency.
    pub expected_version: Option<u64>,
    pub status: Option<BookingStatus>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    /// Recompute the end from the (possibly new) start. Takes precedence
    /// over `end`.
    pub length: Option<BookingEnd>,
    pub purpose: Option<String>,
    pub details: Option<Option<String>>,
    pub instrument_id: Option<Ulid>,
    pub comments: Option<Vec<Comment>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstrument {
    pub name: String,
    pub kind: Option<String>,
    pub model: Option<String>,
    pub location: String,
    pub calibration_due: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentUpdate {
    pub name: Option<String>,
    pub kind: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub location: Option<String>,
    pub status: Option<InstrumentStatus>,
    pub calibration_due: Option<Option<NaiveDate>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOUR_MS;

    #[test]
    fn explicit_end_passes_through() {
        let (end, samples) = BookingEnd::At(5 * HOUR_MS).resolve(HOUR_MS, BookingFlow::Request).unwrap();
        assert_eq!(end, 5 * HOUR_MS);
        assert!(samples.is_none());
    }

    #[test]
    fn flows_use_their_own_setup_default() {
        let end = BookingEnd::Duration {
            manual_hours: 1.0,
            samples: SampleMetadata::new(10, 12.0),
            setup: None,
        };
        let (request_end, _) = end.resolve(0, BookingFlow::Request).unwrap();
        let (quick_end, _) = end.resolve(0, BookingFlow::Quick).unwrap();
        assert_eq!(request_end, 5 * HOUR_MS / 2);
        assert_eq!(quick_end, 2 * HOUR_MS);
    }

    #[test]
    fn unusable_samples_keep_manual_hours() {
        let end = BookingEnd::Duration {
            manual_hours: 1.5,
            samples: SampleMetadata::from_fields("", "12"),
            setup: None,
        };
        let (end, samples) = end.resolve(0, BookingFlow::Request).unwrap();
        assert_eq!(end, 3 * HOUR_MS / 2);
        assert!(samples.is_none());
    }

    #[test]
    fn edit_reuses_stored_samples() {
        let stored = SampleMetadata::new(10, 12.0).unwrap().embed(Some("solvent: D2O"));
        let length = BookingEnd::Duration {
            manual_hours: 1.0,
            samples: None,
            setup: None,
        };
        let (end, samples) = length.resolve_edit(0, Some(&stored)).unwrap();
        // 10 × 12 + 15 = 135 min → 2.5 h
        assert_eq!(end, 5 * HOUR_MS / 2);
        assert_eq!(samples, SampleMetadata::new(10, 12.0));

        let (end, samples) = length.resolve_edit(0, Some("solvent: D2O")).unwrap();
        assert_eq!(end, HOUR_MS);
        assert!(samples.is_none());
    }

    #[test]
    fn edit_prefers_new_samples() {
        let stored = SampleMetadata::new(10, 12.0).unwrap().embed(None);
        let length = BookingEnd::Duration {
            manual_hours: 1.0,
            samples: SampleMetadata::new(20, 12.0),
            setup: None,
        };
        let (end, samples) = length.resolve_edit(0, Some(&stored)).unwrap();
        // 20 × 12 + 15 = 255 min → 4.5 h
        assert_eq!(end, 9 * HOUR_MS / 2);
        assert_eq!(samples, SampleMetadata::new(20, 12.0));
    }

    #[test]
    fn zero_manual_hours_rejected() {
        let end = BookingEnd::Duration {
            manual_hours: 0.0,
            samples: None,
            setup: None,
        };
        assert!(matches!(
            end.resolve(0, BookingFlow::Quick),
            Err(EngineError::Validation(_))
        ));
    }
}
