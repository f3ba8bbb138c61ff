//! Observer WebSocket bridge.
//!
//! Passive browser observers get a coarse `(routingKey, data)` JSON
//! envelope for every bus event except the playlist heartbeat, which is
//! internal-only and far too chatty. A failed send evicts the observer.

use crate::bus::{BusSubscription, EventBus};
use dashmap::DashMap;
use jukeproto::{Event, EventKind, ObserverEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Routing key an event is published under, or `None` for internal-only
/// events.
pub fn routing_key(event: &Event) -> Option<String> {
    match event {
        Event::SongCreated { playlist_id, .. }
        | Event::SongStatusChanged { playlist_id, .. }
        | Event::SongDeleted { playlist_id, .. }
        | Event::SongMetadataUpdated { playlist_id, .. }
        | Event::SongReordered { playlist_id } => Some(format!("songs.{playlist_id}")),
        Event::PlaylistHeartbeat { .. } => None,
        Event::PlaylistCreated { .. }
        | Event::PlaylistSteered { .. }
        | Event::PlaylistStatusChanged { .. }
        | Event::PlaylistUpdated { .. }
        | Event::PlaylistDeleted { .. } => Some("playlists".to_string()),
        Event::SettingsChanged => Some("settings".to_string()),
    }
}

struct BridgeInner {
    observers: DashMap<u64, mpsc::UnboundedSender<String>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct ObserverBridge {
    inner: Arc<BridgeInner>,
}

impl ObserverBridge {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                observers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register one observer; the receiver feeds its socket writer task.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.observers.insert(id, tx);
        debug!(observer.id = id, observers = self.inner.observers.len(), "observer connected");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if self.inner.observers.remove(&id).is_some() {
            debug!(observer.id = id, observers = self.inner.observers.len(), "observer disconnected");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Attach the bus handler. The returned subscription must be kept
    /// alive.
    pub fn attach(&self, bus: &EventBus) -> BusSubscription {
        let bridge = self.clone();
        bus.subscribe("observer-bridge", EventKind::all(), move |event| {
            let bridge = bridge.clone();
            async move {
                bridge.publish(&event);
                Ok(())
            }
        })
    }

    fn publish(&self, event: &Event) {
        let Some(key) = routing_key(event) else {
            return;
        };
        let envelope = ObserverEnvelope {
            routing_key: key,
            data: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        };
        let Ok(text) = serde_json::to_string(&envelope) else {
            warn!("observer envelope serialization failed");
            return;
        };

        let mut dead = Vec::new();
        for entry in self.inner.observers.iter() {
            if entry.value().send(text.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }
}

impl Default for ObserverBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukeproto::{PlaylistId, SongId, SongStatus};

    #[test]
    fn test_routing_keys() {
        let song_event = Event::SongStatusChanged {
            song_id: SongId::new("s1"),
            playlist_id: PlaylistId::new("pl-X"),
            status: SongStatus::Ready,
        };
        assert_eq!(routing_key(&song_event).unwrap(), "songs.pl-X");

        let steered = Event::PlaylistSteered {
            playlist_id: PlaylistId::new("pl-X"),
            prompt_epoch: 2,
        };
        assert_eq!(routing_key(&steered).unwrap(), "playlists");

        assert_eq!(routing_key(&Event::SettingsChanged).unwrap(), "settings");

        let heartbeat = Event::PlaylistHeartbeat {
            playlist_id: PlaylistId::new("pl-X"),
        };
        assert!(routing_key(&heartbeat).is_none());
    }

    #[tokio::test]
    async fn test_publish_and_evict() {
        let bridge = ObserverBridge::new();
        let (id_a, mut rx_a) = bridge.register();
        let (_id_b, rx_b) = bridge.register();
        assert_eq!(bridge.observer_count(), 2);

        // Drop b's receiver: next publish must evict it.
        drop(rx_b);

        bridge.publish(&Event::SettingsChanged);
        let text = rx_a.recv().await.unwrap();
        let envelope: ObserverEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.routing_key, "settings");
        assert_eq!(bridge.observer_count(), 1);

        // Heartbeats never reach observers.
        bridge.publish(&Event::PlaylistHeartbeat {
            playlist_id: PlaylistId::new("pl"),
        });
        assert!(rx_a.try_recv().is_err());

        bridge.unregister(id_a);
        assert_eq!(bridge.observer_count(), 0);
    }
}
