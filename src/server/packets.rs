//! Packet event WebSocket channel.
//!
//! Subscribers join the global fan-out; each frame batches the events
//! available at send time under a per-connection monotone sequence number
//! plus a running count of events dropped while the subscriber lagged.
//! Clients send nothing meaningful (heartbeats are consumed and ignored);
//! disconnecting drops the subscriber immediately.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::observer::PacketEvent;

use super::AppState;

/// Cap on events carried by one frame.
const MAX_BATCH: usize = 64;

#[derive(Serialize)]
struct PacketFrame<'a> {
    seq: u64,
    /// Events discarded for this subscriber since the last frame.
    dropped: u64,
    events: Vec<&'a PacketEvent>,
}

pub async fn packets_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(socket: WebSocket, state: AppState) {
    let mut feed = state.topology.subscribe_packets();
    let (mut sink, mut stream) = socket.split();
    let mut seq: u64 = 0;
    let mut dropped: u64 = 0;
    debug!("packet channel attached");

    loop {
        tokio::select! {
            event = feed.recv() => {
                let mut batch: Vec<Arc<PacketEvent>> = Vec::new();
                match event {
                    Ok(event) => batch.push(event),
                    Err(RecvError::Lagged(n)) => {
                        dropped += n;
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                }
                // Drain whatever else is already queued, up to the cap.
                while batch.len() < MAX_BATCH {
                    match feed.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }

                let frame = PacketFrame {
                    seq,
                    dropped,
                    events: batch.iter().map(Arc::as_ref).collect(),
                };
                seq += 1;
                dropped = 0;

                let payload = match serde_json::to_string(&frame) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // heartbeat; ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("packet channel detached");
}
