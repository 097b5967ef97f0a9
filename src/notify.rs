use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per section.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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
        }
    }

    /// Subscribe to a section's events. Creates the channel if needed.
    pub fn subscribe(&self, section_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(section_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, section_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&section_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (the section was archived).
    pub fn remove(&self, section_id: &Ulid) {
        self.channels.remove(section_id);
    }

    pub fn listeners(&self, section_id: &Ulid) -> usize {
        self.channels
            .get(section_id)
            .map_or(0, |s| s.receiver_count())
    }
}
