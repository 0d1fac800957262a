mod availability;
mod compact;
mod conflict;
mod delay;
mod error;
mod mutations;
mod notices;
mod queries;
mod requests;

pub use availability::{Slot, booked_intervals_in, merge_overlapping, slot_grid, subtract_intervals};
pub use delay::DelayReport;
pub use error::EngineError;
pub use queries::Snapshot;
pub use requests::{BookingEnd, BookingFlow, BookingUpdate, InstrumentUpdate, NewBooking, NewInstrument};

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{error, info};
use ulid::Ulid;

use crate::config::Policy;
use crate::identity::Directory;
use crate::mailer::Notifier;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedInstrumentState = Arc<RwLock<InstrumentState>>;
pub(crate) type InstrumentGuard = OwnedRwLockWriteGuard<InstrumentState>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<PendingAppend> = Vec::new();
        let mut deferred = None;
        match cmd {
            WalCommand::Append { event, response } => batch.push((event, response)),
            other => deferred = Some(other),
        }
        while deferred.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => deferred = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            commit_batch(&mut wal, batch);
        }
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every caller in the batch is told it failed, so none of it may replay.
    if let Err(e) = &result
        && let Err(rollback) = wal.rollback()
    {
        error!(error = %e, %rollback, "WAL rollback failed; log may hold a failed batch");
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The outside world the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Arc<dyn Notifier>,
    pub directory: Arc<dyn Directory>,
}

pub struct Engine {
    pub instruments: DashMap<Ulid, SharedInstrumentState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → instrument id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) mailer: Arc<dyn Notifier>,
    pub(super) directory: Arc<dyn Directory>,
    /// Held for writing while instruments are added or removed; whole-lab
    /// operations (delay, compaction) hold it for reading.
    pub(super) catalog: RwLock<()>,
    pub policy: Policy,
}

/// Apply an event to one instrument (no locking; caller holds the lock).
///
/// Events that span instruments (moves, bulk shifts) are applied to each
/// involved instrument in turn; every arm only touches what belongs to `rs`.
fn apply_to_instrument(rs: &mut InstrumentState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    let here = rs.id();
    match event {
        Event::InstrumentUpdated { instrument } => {
            if rs.instrument.name != instrument.name {
                for b in &mut rs.bookings {
                    b.instrument_name = instrument.name.clone();
                }
            }
            rs.instrument = instrument.clone();
        }
        Event::MaintenanceLogged { entry, .. } => {
            rs.instrument.maintenance_history.push(entry.clone());
        }
        Event::BookingCreated { booking } => {
            rs.insert_booking(booking.clone());
            index.insert(booking.id, here);
        }
        Event::BookingUpdated {
            booking,
            from_instrument,
        } => {
            if booking.instrument_id == here {
                rs.upsert_booking(booking.clone());
                index.insert(booking.id, here);
            } else if *from_instrument == here {
                rs.remove_booking(booking.id);
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            index.remove(id);
        }
        Event::BookingsShifted { ids, delta, at } => {
            let ids: HashSet<&Ulid> = ids.iter().collect();
            let mut touched = false;
            for b in rs.bookings.iter_mut().filter(|b| ids.contains(&b.id)) {
                b.span = b.span.shifted(*delta);
                b.updated_at = *at;
                b.version += 1;
                touched = true;
            }
            if touched {
                rs.bookings.sort_by_key(|b| b.span.start);
            }
        }
        Event::CommentAdded {
            booking_id,
            comment,
        } => {
            if let Some(b) = rs.booking_mut(*booking_id) {
                b.comments.push(comment.clone());
                b.version += 1;
            }
        }
        Event::CommentDeleted {
            booking_id,
            comment_id,
        } => {
            if let Some(b) = rs.booking_mut(*booking_id) {
                b.comments.retain(|c| c.id != *comment_id);
                b.version += 1;
            }
        }
        // Created/Deleted are handled at the DashMap level, not here
        Event::InstrumentCreated { .. } | Event::InstrumentDeleted { .. } => {}
    }
}

/// Instruments an event touches, for replay.
fn event_instruments(event: &Event, index: &DashMap<Ulid, Ulid>) -> Vec<Ulid> {
    let lookup = |id: &Ulid| index.get(id).map(|e| *e.value());
    let mut ids: Vec<Ulid> = match event {
        Event::InstrumentUpdated { instrument } => vec![instrument.id],
        Event::MaintenanceLogged { instrument_id, .. }
        | Event::BookingDeleted { instrument_id, .. } => vec![*instrument_id],
        Event::BookingCreated { booking } => vec![booking.instrument_id],
        Event::BookingUpdated {
            booking,
            from_instrument,
        } => vec![*from_instrument, booking.instrument_id],
        Event::BookingsShifted { ids, .. } => ids.iter().filter_map(lookup).collect(),
        Event::CommentAdded { booking_id, .. } | Event::CommentDeleted { booking_id, .. } => {
            lookup(booking_id).into_iter().collect()
        }
        Event::InstrumentCreated { .. } | Event::InstrumentDeleted { .. } => Vec::new(),
    };
    ids.sort();
    ids.dedup();
    ids
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        collaborators: Collaborators,
        policy: Policy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            instruments: DashMap::new(),
            wal_tx,
            notify,
            booking_index: DashMap::new(),
            mailer: collaborators.mailer,
            directory: collaborators.directory,
            catalog: RwLock::new(()),
            policy,
        };

        // Sole owner of these Arcs during replay: try_write never contends.
        // blocking_write would panic when called from async code.
        for event in &events {
            match event {
                Event::InstrumentCreated { instrument } => {
                    let rs = InstrumentState::new(instrument.clone());
                    engine
                        .instruments
                        .insert(instrument.id, Arc::new(RwLock::new(rs)));
                }
                Event::InstrumentDeleted { id } => {
                    engine.instruments.remove(id);
                }
                other => {
                    for iid in event_instruments(other, &engine.booking_index) {
                        let Some(entry) = engine.instruments.get(&iid) else {
                            continue;
                        };
                        let shared = entry.value().clone();
                        drop(entry);
                        if let Ok(mut guard) = shared.try_write() {
                            apply_to_instrument(&mut guard, other, &engine.booking_index);
                        }
                    }
                }
            }
        }

        metrics::gauge!(observability::INSTRUMENTS_ACTIVE).set(engine.instruments.len() as f64);
        info!(
            events = events.len(),
            instruments = engine.instruments.len(),
            bookings = engine.booking_index.len(),
            "replayed WAL"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_instrument_state(&self, id: &Ulid) -> Option<SharedInstrumentState> {
        self.instruments.get(id).map(|e| e.value().clone())
    }

    pub fn instrument_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append, then apply to every target and publish on the change feed.
    /// Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        targets: &mut [&mut InstrumentState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let mut ids = Vec::with_capacity(targets.len());
        for rs in targets.iter_mut() {
            apply_to_instrument(rs, event, &self.booking_index);
            ids.push(rs.id());
        }
        self.notify.send(&ids, event);
        Ok(())
    }

    /// Write-lock several instruments in id order, which keeps concurrent
    /// multi-instrument operations deadlock free. Duplicates are collapsed.
    pub(super) async fn lock_instruments(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<InstrumentGuard>, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let rs = self.get_instrument_state(&id).ok_or(EngineError::NotFound(id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(guards)
    }

    /// Lookup booking → instrument and write-lock it. Retries if the booking
    /// moved between lookup and lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<InstrumentGuard, EngineError> {
        for _ in 0..3 {
            let iid = self
                .instrument_of_booking(booking_id)
                .ok_or(EngineError::NotFound(*booking_id))?;
            let rs = self
                .get_instrument_state(&iid)
                .ok_or(EngineError::NotFound(iid))?;
            let guard = rs.write_owned().await;
            if guard.booking(*booking_id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(*booking_id))
    }
}

pub(super) fn guard_position(guards: &[InstrumentGuard], id: Ulid) -> Option<usize> {
    guards.iter().position(|g| g.id() == id)
}
