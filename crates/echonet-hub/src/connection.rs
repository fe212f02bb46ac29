//! Drives one `/ws` connection: a reader loop for client commands and
//! an event-staging loop that coalesces registry change events before
//! flushing them to a bounded outgoing queue.
//!
//! Grounded on the per-connection `tokio::select!` loop combining
//! socket recv with a command channel, and on the broadcast-receiver
//! writer task pattern (`Lagged`/`Closed` handling) used for fanning
//! out to multiple local consumers elsewhere in this codebase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use echonet_protocol::{ClientEnvelope, ClientMessage, ErrorCode, EventPayload, ServerMessage};
use echonet_transport::Transport;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use crate::commands::{self, CommandError};
use crate::router::HubState;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const COALESCE_FLUSH_INTERVAL: Duration = Duration::from_millis(20);
/// Consecutive flush ticks that find the outbound queue still full
/// before giving up on individual events and sending a resync sentinel.
const RESYNC_AFTER_FULL_TICKS: u32 = 3;

pub async fn handle_socket<T: Transport>(socket: WebSocket, state: HubState<T>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let seq = AtomicU64::new(0);
    let mut events_rx = state.registry.subscribe();
    // Clients opt in explicitly with `Subscribe{enabled:true}`; a
    // connection that only wants to issue commands never pays for
    // event staging.
    let mut subscribed = false;
    let mut staging: HashMap<String, EventPayload> = HashMap::new();
    let mut consecutive_full = 0u32;
    let mut flush_interval = tokio::time::interval(COALESCE_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(enable) = handle_client_text(&text, &state, &outbound_tx).await {
                            subscribed = enable;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(%err, "websocket read error");
                        break;
                    }
                }
            }
            received = events_rx.recv() => {
                if !subscribed {
                    continue;
                }
                match received {
                    Ok(payload) => stage_event(&mut staging, payload),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        staging.clear();
                        send_resync(&outbound_tx, &seq).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = flush_interval.tick() => {
                if subscribed {
                    flush_staged(&mut staging, &outbound_tx, &seq, &mut consecutive_full).await;
                }
            }
        }
    }

    writer.abort();
}

async fn handle_client_text<T: Transport>(
    text: &str,
    state: &HubState<T>,
    outbound_tx: &mpsc::Sender<ServerMessage>,
) -> Option<bool> {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            let _ = outbound_tx
                .send(ServerMessage::Error {
                    request_id: None,
                    code: ErrorCode::MalformedFrame,
                    message: err.to_string(),
                })
                .await;
            return None;
        }
    };

    let subscribe_toggle = match &envelope.message {
        ClientMessage::Subscribe { enabled } => Some(*enabled),
        _ => None,
    };

    let request_id = envelope.request_id.clone();
    let result = commands::dispatch(envelope.message, &state.registry, &state.engine).await;
    let reply = match result {
        Ok(payload) => match request_id {
            Some(request_id) => ServerMessage::Response { request_id, payload },
            None => return subscribe_toggle,
        },
        Err(CommandError { code, message }) => ServerMessage::Error {
            request_id,
            code,
            message,
        },
    };
    let _ = outbound_tx.send(reply).await;
    subscribe_toggle
}

fn stage_event(staging: &mut HashMap<String, EventPayload>, payload: EventPayload) {
    if let Some(key) = commands::coalescing_key(&payload) {
        match staging.remove(&key) {
            Some(existing) => {
                staging.insert(key, commands::merge_staged(existing, payload));
            }
            None => {
                staging.insert(key, payload);
            }
        }
    }
}

async fn flush_staged(
    staging: &mut HashMap<String, EventPayload>,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    seq: &AtomicU64,
    consecutive_full: &mut u32,
) {
    if staging.is_empty() {
        *consecutive_full = 0;
        return;
    }
    let keys: Vec<String> = staging.keys().cloned().collect();
    let mut hit_full = false;
    for key in keys {
        let Some(payload) = staging.get(&key).cloned() else {
            continue;
        };
        let message = ServerMessage::Event {
            seq: seq.fetch_add(1, Ordering::Relaxed) + 1,
            payload,
        };
        match outbound_tx.try_send(message) {
            Ok(()) => {
                staging.remove(&key);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                hit_full = true;
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }

    if hit_full {
        *consecutive_full += 1;
        if *consecutive_full >= RESYNC_AFTER_FULL_TICKS {
            staging.clear();
            send_resync(outbound_tx, seq).await;
            *consecutive_full = 0;
        }
    } else {
        *consecutive_full = 0;
    }
}

async fn send_resync(outbound_tx: &mpsc::Sender<ServerMessage>, seq: &AtomicU64) {
    let message = ServerMessage::Event {
        seq: seq.fetch_add(1, Ordering::Relaxed) + 1,
        payload: EventPayload::Resync,
    };
    let _ = outbound_tx.try_send(message);
}
