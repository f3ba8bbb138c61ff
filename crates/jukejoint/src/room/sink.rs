//! Narrow socket capability owned by a room.
//!
//! The server speaks to devices over axum WebSockets and to tests over
//! plain channels; a room only ever needs "is it open" and "queue this
//! text frame", so that is the whole trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub trait DeviceSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queue one text frame. Returns false when the peer is gone; the room
    /// drops the device on a false return.
    fn send(&self, text: String) -> bool;
}

/// Channel-backed sink: a writer task drains the receiver into the actual
/// socket, so sends from the room's serialized context never block and
/// arrive in order.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        (
            Self {
                tx,
                open: open.clone(),
            },
            rx,
            open,
        )
    }
}

impl DeviceSink for ChannelSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(text).is_ok()
    }
}
