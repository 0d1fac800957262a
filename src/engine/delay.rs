use tracing::info;
use ulid::Ulid;

use crate::identity::Actor;
use crate::limits::MAX_DELAY_MINUTES;
use crate::mailer::Template;
use crate::model::*;
use crate::observability;
use crate::timeutil::now_ms;

use super::conflict::{require_admin, validate_span};
use super::notices::Notice;
use super::{Engine, EngineError};

/// Outcome of a bulk delay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayReport {
    pub affected: usize,
    /// Ids of the shifted bookings, by original start.
    pub shifted: Vec<Ulid>,
}

impl Engine {
    /// Push every booking starting at or after `cutoff` back by
    /// `delay_minutes`, across all instruments.
    ///
    /// Durations are preserved and status is untouched. All shifts go to the
    /// WAL as one record while every instrument is write-locked, so either
    /// all bookings move or none do. Owners are told afterwards; a failed
    /// notice does not undo anything.
    pub async fn apply_delay(
        &self,
        actor: &Actor,
        delay_minutes: i64,
        cutoff: Ms,
    ) -> Result<DelayReport, EngineError> {
        require_admin(actor, "only admins delay the schedule")?;
        if delay_minutes <= 0 {
            return Err(EngineError::validation("delay must be a positive number of minutes"));
        }
        if delay_minutes > MAX_DELAY_MINUTES {
            return Err(EngineError::LimitExceeded("delay too long"));
        }
        let delta = delay_minutes * MINUTE_MS;

        let catalog = self.catalog.read().await;
        let ids: Vec<Ulid> = self.instruments.iter().map(|e| *e.key()).collect();
        let mut guards = self.lock_instruments(&ids).await?;

        let mut affected: Vec<Booking> = guards
            .iter()
            .flat_map(|g| g.bookings.iter().filter(move |b| b.span.start >= cutoff))
            .cloned()
            .collect();
        if affected.is_empty() {
            info!(cutoff, delay_minutes, "delay matched no bookings");
            return Ok(DelayReport::default());
        }
        affected.sort_by_key(|b| b.span.start);
        for b in &affected {
            validate_span(&b.span.shifted(delta))?;
        }

        let shifted: Vec<Ulid> = affected.iter().map(|b| b.id).collect();
        let event = Event::BookingsShifted {
            ids: shifted.clone(),
            delta,
            at: now_ms(),
        };
        let mut targets: Vec<&mut InstrumentState> = guards
            .iter_mut()
            .filter(|g| g.bookings.iter().any(|b| b.span.start >= cutoff))
            .map(|g| &mut **g)
            .collect();
        self.persist_and_apply(&mut targets, &event).await?;
        drop(targets);
        drop(guards);
        drop(catalog);

        info!(by = %actor.id, cutoff, delay_minutes, affected = shifted.len(), "schedule delayed");
        metrics::counter!(observability::DELAYS_APPLIED_TOTAL).increment(1);
        metrics::histogram!(observability::DELAY_AFFECTED_BOOKINGS).record(shifted.len() as f64);

        let notices = affected
            .iter()
            .map(|b| {
                let mut moved = b.clone();
                moved.span = b.span.shifted(delta);
                Notice::to_owner(&moved, Template::BookingDelayed)
                    .with("delay_minutes", delay_minutes.to_string())
            })
            .collect();
        self.deliver_all(notices).await;

        Ok(DelayReport {
            affected: shifted.len(),
            shifted,
        })
    }
}
