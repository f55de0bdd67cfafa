// =============================================================================
// WebSocket Handler — price-update push stream
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate snapshot of every pair's current runtime state.
//   2. A fresh snapshot every 500 ms whenever it differs from the last one
//      sent (cheap string comparison, no separate version counter needed
//      since the bot manager has none to read).
//
// The handler also:
//   - Responds to Ping frames with Pong frames.
//   - Tracks a per-connection `sequence` number that increments on every
//     outbound message.
//   - Treats inbound text frames as a heartbeat (logged, otherwise ignored).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::rest::ApiState;
use crate::domain::PairRecord;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
///
/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two concurrent tasks via `tokio::select!`:
///   1. **Push loop** — every 500 ms, push a fresh pairs snapshot if it
///      differs from the last one sent.
///   2. **Recv loop** — process incoming client messages (Ping/Pong, Close,
///      heartbeat text messages).
async fn handle_ws_connection(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    let mut sequence: u64 = 0;
    let mut last_payload = String::new();

    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence, &mut last_payload).await {
        warn!(error = %e, "failed to send initial WebSocket snapshot");
        info!("WebSocket connection closed — cleanup complete");
        return;
    }

    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence, &mut last_payload).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("WebSocket Ping received — sending Pong");
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("WebSocket Pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended (None)");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection closed — cleanup complete");
}

/// Serialize and send the current pairs snapshot over the WebSocket, unless
/// it's identical to the last one sent. Increments `sequence` on each send.
async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<ApiState>,
    sequence: &mut u64,
    last_payload: &mut String,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;

    let pairs: Vec<PairRecord> = state.manager.list_pairs();
    let json = match serde_json::to_string(&pairs) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize pairs snapshot");
            return Ok(());
        }
    };

    if json == *last_payload {
        return Ok(());
    }

    sender.send(Message::Text(json.clone().into())).await?;
    *sequence += 1;
    *last_payload = json;
    debug!(seq = *sequence, "WebSocket price-update snapshot sent");
    Ok(())
}
