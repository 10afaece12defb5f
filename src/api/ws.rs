//! `/events/stream`: subscribes to `traffic:persisted` and
//! `traffic:alert` and forwards both as WebSocket text frames (§4.8).
//!
//! Backpressure: a bounded outbound queue per connection. When the
//! queue fills, the oldest message is dropped and a single `overflow`
//! notice is sent once the queue has room again, rather than stalling
//! ingestion behind a slow client. A 30s ping/pong heartbeat closes the
//! connection after two consecutive missed pongs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use crate::broker::channels;
use super::state::AppState;

const MISSED_PONG_LIMIT: u32 = 2;

pub async fn stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut persisted_rx = state.broker.subscribe(channels::PERSISTED);
    let mut alert_rx = state.broker.subscribe(channels::ALERT);

    let high_water_mark = state.config.ws_high_water_mark;
    let mut outbound: VecDeque<String> = VecDeque::with_capacity(high_water_mark);
    let mut overflowed = false;

    let missed_pongs = Arc::new(AtomicU32::new(0));
    let mut heartbeat = tokio::time::interval(Duration::from_secs(state.config.ws_ping_interval_secs));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if missed_pongs.fetch_add(1, Ordering::Relaxed) >= MISSED_PONG_LIMIT {
                    debug!(component = "api_ws", "closing connection after missed pongs");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = persisted_rx.recv() => {
                match msg {
                    Ok(bytes) => enqueue(&mut outbound, &mut overflowed, high_water_mark, String::from_utf8_lossy(&bytes).into_owned()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = alert_rx.recv() => {
                match msg {
                    Ok(bytes) => enqueue(&mut outbound, &mut overflowed, high_water_mark, String::from_utf8_lossy(&bytes).into_owned()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs.store(0, Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(component = "api_ws", error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }

        if overflowed {
            let notice = json!({ "type": "overflow", "message": "outbound queue overflowed, oldest messages dropped" }).to_string();
            if sender.send(Message::Text(notice.into())).await.is_err() {
                break;
            }
            overflowed = false;
        }

        while let Some(payload) = outbound.pop_front() {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                return;
            }
        }
    }
}

fn enqueue(outbound: &mut VecDeque<String>, overflowed: &mut bool, high_water_mark: usize, payload: String) {
    if outbound.len() >= high_water_mark {
        outbound.pop_front();
        *overflowed = true;
    }
    outbound.push_back(payload);
}
