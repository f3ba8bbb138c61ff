//! In-process event bus.
//!
//! Typed pub/sub connecting HTTP mutations, the generation pipeline, the
//! rooms, and the observer bridge. Delivery is fire-and-forget: `emit`
//! returns immediately and every subscriber registered at emit time sees
//! the event at least once. Each subscription drains its own unbounded
//! channel in one worker task, so a subscriber observes same-kind emits in
//! emission order and a slow handler never blocks `emit` or its peers.

use jukeproto::{Event, EventKind};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type BoxedHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<(u64, Event)>,
}

struct BusInner {
    subscribers: RwLock<HashMap<EventKind, Vec<SubscriberEntry>>>,
    next_sub_id: AtomicU64,
    seq: AtomicU64,
    handler_slow: Duration,
    trace: bool,
}

/// Process-wide event bus handle. Cheap to clone; all clones share one
/// registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(handler_slow_ms: u64, trace: bool) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                seq: AtomicU64::new(1),
                handler_slow: Duration::from_millis(handler_slow_ms),
                trace,
            }),
        }
    }

    /// Register `handler` for the given kinds.
    ///
    /// The returned subscription unsubscribes on drop; events already
    /// queued at that moment are still handled, later emits are not.
    pub fn subscribe<F, Fut>(
        &self,
        name: impl Into<String>,
        kinds: &[EventKind],
        handler: F,
    ) -> BusSubscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name: Arc<str> = name.into().into();
        let handler: BoxedHandler = Arc::new(move |event| Box::pin(handler(event)));

        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut subscribers = self.inner.subscribers.write().unwrap();
            for kind in kinds {
                subscribers.entry(*kind).or_default().push(SubscriberEntry {
                    id,
                    tx: tx.clone(),
                });
            }
        }

        let worker = spawn_worker(name.clone(), rx, handler, self.inner.handler_slow);

        debug!(subscriber = %name, kinds = kinds.len(), "bus subscription registered");

        BusSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
            kinds: kinds.to_vec(),
            _worker: worker,
        }
    }

    /// Publish one event. Never fails, never blocks on handlers.
    pub fn emit(&self, event: Event) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();

        if self.inner.trace {
            debug!(kind = %kind, seq, "bus emit");
        }

        let mut dead = Vec::new();
        {
            let subscribers = self.inner.subscribers.read().unwrap();
            if let Some(entries) = subscribers.get(&kind) {
                for entry in entries {
                    if entry.tx.send((seq, event.clone())).is_err() {
                        dead.push(entry.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.inner.subscribers.write().unwrap();
            if let Some(entries) = subscribers.get_mut(&kind) {
                entries.retain(|e| !dead.contains(&e.id));
            }
        }
    }

    /// The sequence number the next emit will be tagged with.
    pub fn next_sequence(&self) -> u64 {
        self.inner.seq.load(Ordering::Relaxed)
    }

    /// Drop every registration. Used only by tests.
    pub fn remove_all(&self) {
        self.inner.subscribers.write().unwrap().clear();
    }

    fn unsubscribe(inner: &BusInner, id: u64, kinds: &[EventKind]) {
        let mut subscribers = inner.subscribers.write().unwrap();
        for kind in kinds {
            if let Some(entries) = subscribers.get_mut(kind) {
                entries.retain(|e| e.id != id);
            }
        }
    }
}

fn spawn_worker(
    name: Arc<str>,
    mut rx: mpsc::UnboundedReceiver<(u64, Event)>,
    handler: BoxedHandler,
    slow: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((seq, event)) = rx.recv().await {
            let kind = event.kind();
            let started = Instant::now();
            let result = handler(event).await;
            let elapsed = started.elapsed();

            if let Err(error) = result {
                warn!(
                    subscriber = %name,
                    kind = %kind,
                    seq,
                    error = %error,
                    "event handler failed"
                );
            }
            if elapsed >= slow {
                warn!(
                    subscriber = %name,
                    kind = %kind,
                    seq,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow event handler"
                );
            }
        }
    })
}

/// Live registration on the bus. Unsubscribes on drop.
pub struct BusSubscription {
    inner: std::sync::Weak<BusInner>,
    id: u64,
    kinds: Vec<EventKind>,
    _worker: JoinHandle<()>,
}

impl BusSubscription {
    /// Explicit unsubscribe; later emits are no longer delivered.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            EventBus::unsubscribe(&inner, self.id, &self.kinds);
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukeproto::{PlaylistId, SongId};
    use std::sync::Mutex;

    fn song_created(n: u32) -> Event {
        Event::SongCreated {
            song_id: SongId::new(format!("s{n}")),
            playlist_id: PlaylistId::new("pl1"),
        }
    }

    async fn settle() {
        // Workers run on the same runtime; a couple of yields lets the
        // unbounded queues drain.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_same_kind_emits_arrive_in_order() {
        let bus = EventBus::new(200, false);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _sub = bus.subscribe("order", &[EventKind::SongCreated], move |event| {
            let seen = seen_clone.clone();
            async move {
                if let Event::SongCreated { song_id, .. } = event {
                    seen.lock().unwrap().push(song_id.as_str().to_string());
                }
                Ok(())
            }
        });

        for n in 0..50 {
            bus.emit(song_created(n));
        }
        settle().await;

        let seen = seen.lock().unwrap();
        let expected: Vec<String> = (0..50).map(|n| format!("s{n}")).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_not_invoked() {
        let bus = EventBus::new(200, false);
        let count = Arc::new(AtomicU64::new(0));

        let count_clone = count.clone();
        let sub = bus.subscribe("short-lived", &[EventKind::SongCreated], move |_| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit(song_created(1));
        settle().await;
        sub.unsubscribe();
        bus.emit(song_created(2));
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_peers() {
        let bus = EventBus::new(200, false);
        let ok_count = Arc::new(AtomicU64::new(0));

        let _bad = bus.subscribe("bad", &[EventKind::SongCreated], |_| async {
            anyhow::bail!("boom")
        });
        let ok_clone = ok_count.clone();
        let _good = bus.subscribe("good", &[EventKind::SongCreated], move |_| {
            let count = ok_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit(song_created(1));
        bus.emit(song_created(2));
        settle().await;

        assert_eq!(ok_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(200, true);
        bus.emit(Event::SettingsChanged);
        assert!(bus.next_sequence() >= 2);
    }

    #[tokio::test]
    async fn test_kind_filtering() {
        let bus = EventBus::new(200, false);
        let count = Arc::new(AtomicU64::new(0));

        let count_clone = count.clone();
        let _sub = bus.subscribe("songs-only", &[EventKind::SongCreated], move |_| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit(Event::SettingsChanged);
        bus.emit(song_created(1));
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
