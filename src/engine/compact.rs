use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedInstrumentState, WalCommand};

impl Engine {
    /// Rewrite the WAL with only the events needed to recreate the current
    /// state: each instrument, then its bookings as they are now.
    ///
    /// The catalog lock and a read lock on every instrument are held until
    /// the new file is in place, so no mutation can land in the old file
    /// meanwhile.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.read().await;
        let mut ids: Vec<Ulid> = self.instruments.iter().map(|e| *e.key()).collect();
        ids.sort();
        let states: Vec<SharedInstrumentState> =
            ids.iter().filter_map(|id| self.get_instrument_state(id)).collect();
        let mut guards = Vec::with_capacity(states.len());
        for rs in &states {
            guards.push(rs.read().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::InstrumentCreated {
                instrument: guard.instrument.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);

        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
