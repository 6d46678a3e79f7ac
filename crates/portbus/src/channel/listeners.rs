//! Per-endpoint listener bookkeeping shared by the transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{Envelope, Listener, ListenerId};

/// Listeners of one endpoint, keyed by channel.
#[derive(Default)]
pub(crate) struct ListenerTable {
    channels: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl ListenerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, Listener)>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a listener; the flag reports whether it is the channel's first.
    pub(crate) fn add(&self, channel: &str, listener: Listener) -> (ListenerId, bool) {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.lock();
        let entries = channels.entry(channel.to_owned()).or_default();
        entries.push((id, listener));
        (id, entries.len() == 1)
    }

    /// Removes a listener; the flag reports whether the channel is now empty.
    pub(crate) fn remove(&self, channel: &str, id: ListenerId) -> bool {
        let mut channels = self.lock();
        let Some(entries) = channels.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        if entries.len() == before || !entries.is_empty() {
            return false;
        }
        channels.remove(channel);
        true
    }

    /// Invokes every listener on the envelope's channel.
    ///
    /// Listeners are snapshotted first so they may subscribe or unsubscribe
    /// while running.
    pub(crate) fn dispatch(&self, payload: &Value, envelope: &Envelope) -> usize {
        let snapshot: Vec<Listener> = self
            .lock()
            .get(&envelope.channel)
            .map(|entries| entries.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default();
        for listener in &snapshot {
            listener(payload.clone(), envelope);
        }
        snapshot.len()
    }
}
