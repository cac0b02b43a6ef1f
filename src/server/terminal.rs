//! Terminal WebSocket channel.
//!
//! One channel binds to one PTY session, keyed `(device, channel)`.
//! Client→server frames are JSON (`input` / `resize`); server→client
//! frames are the raw byte stream from the PTY master, sent as binary
//! messages with bytes preserved. On disconnect the session survives for
//! the grace window so a reconnect with the same channel id reattaches.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::EmuError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub channel: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// Client frames, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
}

pub async fn terminal_ws(
    Path(device): Path<String>,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state, device, query))
}

async fn handle(socket: WebSocket, state: AppState, device: String, query: TerminalQuery) {
    let channel = query.channel.unwrap_or_else(|| "default".to_string());
    let rows = query.rows.unwrap_or(24);
    let cols = query.cols.unwrap_or(80);

    let session = match state.topology.open_terminal(&device, &channel, rows, cols) {
        Ok(session) => session,
        Err(e) => {
            close_with_error(socket, &e).await;
            return;
        }
    };

    let mut attachment = state.topology.ptys().attach(&session);
    let (mut sink, mut stream) = socket.split();
    debug!(device, channel, "terminal channel attached");

    loop {
        tokio::select! {
            output = attachment.output.recv() => {
                match output {
                    Some(bytes) => {
                        if sink.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    // Session closed, replaced by a newer attach, or this
                    // subscriber overflowed; either way this channel ends.
                    None => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: "session detached".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Input { data }) => {
                                if let Err(e) = session.write(data.as_bytes()).await {
                                    warn!(device, channel, error = %e, "terminal write failed");
                                    break;
                                }
                            }
                            Ok(ClientFrame::Resize { rows, cols }) => {
                                if let Err(e) = session.resize(rows, cols) {
                                    let _ = sink
                                        .send(Message::Close(Some(CloseFrame {
                                            code: 1008,
                                            reason: e.to_string().into(),
                                        })))
                                        .await;
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(device, channel, error = %e, "bad terminal frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // pings/pongs/binary: ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Keep the shell alive for the grace window; reconnects with the same
    // channel id pick it back up.
    if let Some(epoch) = session.detach(attachment.epoch) {
        state.topology.ptys().schedule_grace(&session, epoch);
        debug!(
            device = session.device,
            channel = session.channel,
            "terminal channel detached; grace timer started"
        );
    }
}

async fn close_with_error(mut socket: WebSocket, err: &EmuError) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: format!("{:?}: {}", err.kind, err.message).into(),
        })))
        .await;
}
