//! Device (room) WebSocket endpoint.
//!
//! The first frame must be `join`; after that the connection belongs to
//! one room until it closes. Outbound frames flow through a channel sink
//! drained by the writer task, so the room never blocks on a slow socket.

use super::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use jukeproto::{ClientMessage, DeviceId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a fresh connection has to send its join frame.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // First frame: join.
    let join = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                Message::Text(text) => return decode_join(text.as_str()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    let Some((room_id, device_id, name, role)) = join else {
        debug!("room socket closed before a valid join frame");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };

    let (sink, mut out_rx, open) = crate::room::ChannelSink::new();
    let sink: Arc<dyn crate::room::DeviceSink> = Arc::new(sink);

    // Writer: drain the room's frames into the socket, in order.
    let writer_open = open.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                writer_open.store(false, Ordering::Relaxed);
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let room = state.manager.get_or_create(room_id.clone());
    // Load the queue before the device's welcome frames go out.
    state.sync.refresh_room(&room).await;
    room.add_device(device_id.clone(), name, role, sink).await;
    info!(room.id = %room_id, device.id = %device_id, "room socket established");

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => match jukeproto::decode_client_message(text.as_str()) {
                Ok(frame) => room.handle_message(&device_id, frame).await,
                Err(error) => {
                    warn!(device.id = %device_id, error = %error, "bad room frame dropped");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    open.store(false, Ordering::Relaxed);
    room.remove_device(&device_id).await;
    writer.abort();
    info!(room.id = %room_id, device.id = %device_id, "room socket closed");
}

fn decode_join(
    text: &str,
) -> Option<(jukeproto::RoomId, DeviceId, String, jukeproto::DeviceRole)> {
    match jukeproto::decode_client_message(text) {
        Ok(ClientMessage::Join {
            room_id,
            device_id,
            name,
            role,
        }) => Some((room_id, device_id, name, role)),
        Ok(other) => {
            debug!("expected join, got {other:?}");
            None
        }
        Err(error) => {
            debug!(error = %error, "undecodable join frame");
            None
        }
    }
}
