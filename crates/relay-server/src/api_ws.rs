//! WebSocket API handler: one voice session per connection.

use crate::events::{timestamp, InboundEvent, OutboundEvent, Outbox};
use crate::session::{Flow, Session};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

/// Outbound queue depth per connection. Beyond this the client is too slow
/// and events are dropped.
const OUTBOUND_QUEUE: usize = 256;

/// How long queued events get to reach the client after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::debug!(remote_addr = %addr, "websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handles the WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    // Forwards queued events to the socket. When told to close, it drains
    // what is already queued, then sends a close frame.
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = &mut close_rx => {
                    while let Ok(msg) = rx.try_recv() {
                        if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sender.send(AxumMessage::Close(None)).await;
    });

    let outbox = Outbox::new(tx, state.settings.client_diagnostics);
    let (stt_tx, mut stt_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(state, connection_id.clone(), outbox.clone(), stt_tx);

    tracing::info!(connection_id = %connection_id, remote_addr = %addr, "connection opened");
    outbox.emit(&OutboundEvent::Connected {
        connection_id: connection_id.clone(),
        timestamp: timestamp(),
    });

    loop {
        let idle_deadline = session.idle_deadline();
        tokio::select! {
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = %connection_id, "websocket error: {}", e);
                        break;
                    }
                    None => break,
                };
                session.touch();

                match msg {
                    AxumMessage::Text(text) => {
                        let event = match serde_json::from_str::<InboundEvent>(text.as_str()) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!(
                                    connection_id = %connection_id,
                                    "ignoring malformed frame: {}",
                                    e
                                );
                                continue;
                            }
                        };
                        if session.handle_event(event).await == Flow::Close {
                            break;
                        }
                    }
                    AxumMessage::Binary(bytes) => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            len = bytes.len(),
                            "ignoring binary frame"
                        );
                    }
                    AxumMessage::Close(_) => break,
                    AxumMessage::Ping(_) | AxumMessage::Pong(_) => {}
                }
            }
            Some(event) = stt_rx.recv() => {
                session.handle_stt_event(event).await;
            }
            () = idle(idle_deadline) => {
                tracing::info!(connection_id = %connection_id, "closing idle connection");
                break;
            }
        }
    }

    // Transport close, transport error and idle eviction all end here.
    session.handle_stop(false).await;
    drop(session);
    drop(outbox);

    let _ = close_tx.send(());
    if tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        tracing::debug!(connection_id = %connection_id, "outbound flush timed out");
    }
    tracing::info!(connection_id = %connection_id, "connection closed");
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
