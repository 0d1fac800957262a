use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed of applied events, per instrument and lab-wide.
///
/// Dashboards subscribe here to know when to recompute statistics.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one instrument. Creates the channel if needed.
    pub fn subscribe(&self, instrument_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(instrument_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Publish an event that touched the given instruments. No-op without listeners.
    pub fn send(&self, instrument_ids: &[Ulid], event: &Event) {
        for id in instrument_ids {
            if let Some(sender) = self.channels.get(id) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event.clone());
    }

    pub fn remove(&self, instrument_id: &Ulid) {
        self.channels.remove(instrument_id);
    }
}
