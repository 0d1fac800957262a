use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedInstrumentState};

/// Consistent copy of everything, for reports.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub instruments: Vec<Instrument>,
    /// Sorted by start.
    pub bookings: Vec<Booking>,
}

impl Engine {
    /// Clone the Arcs out first so no DashMap shard is held across an await.
    fn all_states(&self) -> Vec<SharedInstrumentState> {
        self.instruments.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn get_instrument(&self, id: Ulid) -> Result<Instrument, EngineError> {
        let rs = self.get_instrument_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.instrument.clone())
    }

    /// All instruments, by name.
    pub async fn list_instruments(&self) -> Vec<Instrument> {
        let mut out = Vec::with_capacity(self.instruments.len());
        for rs in self.all_states() {
            out.push(rs.read().await.instrument.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        for _ in 0..3 {
            let iid = self.instrument_of_booking(&id).ok_or(EngineError::NotFound(id))?;
            let Some(rs) = self.get_instrument_state(&iid) else {
                continue;
            };
            if let Some(b) = rs.read().await.booking(id) {
                return Ok(b.clone());
            }
        }
        Err(EngineError::NotFound(id))
    }

    pub async fn bookings_for_instrument(&self, instrument_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_instrument_state(&instrument_id)
            .ok_or(EngineError::NotFound(instrument_id))?;
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out: Vec<Booking> = Vec::new();
        for rs in self.all_states() {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| b.user_id == user_id).cloned());
        }
        out.sort_by_key(|b| b.span.start);
        out
    }

    /// Every booking on every instrument, by start.
    pub async fn list_bookings(&self) -> Vec<Booking> {
        self.snapshot().await.bookings
    }

    /// Comments in insertion order. `NotFound` once the booking is gone.
    pub async fn get_comments(&self, booking_id: Ulid) -> Result<Vec<Comment>, EngineError> {
        Ok(self.get_booking(booking_id).await?.comments)
    }

    /// Reads all instruments under their read locks in id order.
    pub async fn snapshot(&self) -> Snapshot {
        let mut ids: Vec<Ulid> = self.instruments.iter().map(|e| *e.key()).collect();
        ids.sort();
        let states: Vec<SharedInstrumentState> =
            ids.iter().filter_map(|id| self.get_instrument_state(id)).collect();

        let mut guards = Vec::with_capacity(states.len());
        for rs in &states {
            guards.push(rs.read().await);
        }
        let mut snap = Snapshot::default();
        for guard in &guards {
            snap.instruments.push(guard.instrument.clone());
            snap.bookings.extend(guard.bookings.iter().cloned());
        }
        snap.bookings.sort_by_key(|b| b.span.start);
        snap
    }

    /// In-progress bookings whose end has passed.
    pub async fn overdue_in_progress(&self, now: Ms) -> Vec<Booking> {
        let mut out = Vec::new();
        for rs in self.all_states() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| {
                        b.progress == Progress::InProgress && !b.is_cancelled() && b.span.end <= now
                    })
                    .cloned(),
            );
        }
        out
    }
}
