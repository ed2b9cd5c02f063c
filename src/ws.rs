//! WebSocket endpoint for real-time event subscription.
//!
//! A client connects to `/engine/events` and receives every event as
//! a `{type, data, timestamp, sequence, id}` frame. Sending a
//! `{"type": "subscribe", "data": {...}}` frame narrows the feed to
//! an aggregate id prefix and/or a set of event types; `unsubscribe`
//! resets to the full feed. The underlying buffer is bounded: a
//! subscriber that lags is closed and must reconnect (and catch up
//! through the events endpoint).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::AppState;
use crate::events::EventRecord;
use crate::store::EventFilter;

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe(SubscribeRequest),
    Unsubscribe,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    workflow_prefix: Option<String>,
    #[serde(default)]
    kinds: Option<Vec<String>>,
}

impl SubscribeRequest {
    fn into_filter(self) -> EventFilter {
        EventFilter {
            workflow_prefix: self.workflow_prefix,
            kinds: self.kinds.map(|kinds| {
                kinds.into_iter().collect::<HashSet<String>>()
            }),
        }
    }
}

/// Outbound frame for one event record.
fn event_frame(record: &EventRecord) -> Option<String> {
    let mut value = serde_json::to_value(record).ok()?;
    let object = value.as_object_mut()?;
    object.remove("workflow_id");
    object.insert("id".into(), json!(record.aggregate_path()));
    serde_json::to_string(object).ok()
}

/// GET /engine/events (WebSocket upgrade)
pub async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    info!(client_id = %client_id, "event subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    // Subscribe unfiltered and filter locally so that a client can
    // re-scope its feed without tearing the subscription down.
    let mut subscription = state.engine.subscribe(EventFilter::default());
    let mut filter = EventFilter::default();

    loop {
        tokio::select! {
            record = subscription.next() => match record {
                Some(record) if filter.matches(&record) => {
                    let Some(frame) = event_frame(&record) else { continue };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    // Buffer overflow or store gone; the client must
                    // reconnect and catch up via the events endpoint.
                    warn!(client_id = %client_id, "subscription closed, dropping client");
                    let _ = sender
                        .send(Message::Text(
                            json!({"type": "error", "data": {"error": "subscription lagged"}})
                                .to_string(),
                        ))
                        .await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Subscribe(request)) => {
                        debug!(client_id = %client_id, "subscription filter updated");
                        filter = request.into_filter();
                    }
                    Ok(ClientFrame::Unsubscribe) => {
                        filter = EventFilter::default();
                    }
                    Err(e) => {
                        debug!(client_id = %client_id, "ignoring malformed client frame: {e}");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id = %client_id, "websocket error: {e}");
                    break;
                }
            },
        }
    }

    info!(client_id = %client_id, "event subscriber disconnected");
}
