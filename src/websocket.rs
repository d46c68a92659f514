//! Live image-progress WebSocket.
//!
//! Clients connect to `/ws/dreams/{dream_id}/images?token=...` and receive
//! every event the workers publish for that dream, a `ping` heartbeat every
//! 15 seconds, and on-demand status snapshots. Connections that fail token
//! or ownership checks are closed with code 4001.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::database::AppState;
use crate::notifications::{ImageEventStatus, ImagePayload};
use crate::{auth, dreams};

const SERVER_PING_INTERVAL: Duration = Duration::from_secs(15);
const CLOSE_UNAUTHORIZED: u16 = 4001;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/dreams/{dream_id}/images", get(dream_images_ws))
}

async fn dream_images_ws(
    State(state): State<Arc<AppState>>,
    Path(dream_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = match params.get("token") {
        Some(token) => match auth::user_from_token(&state.config.jwt_secret, token) {
            Ok(user_id) => auth::dream_owned_by(&state, dream_id, user_id)
                .await
                .unwrap_or(false),
            Err(_) => false,
        },
        None => false,
    };

    if !authorized {
        return ws.on_upgrade(|socket| reject_socket(socket));
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, dream_id))
}

async fn reject_socket(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "invalid token".into(),
        })))
        .await;
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, dream_id: Uuid) {
    let mut events = state.image_events.subscribe(dream_id).await;

    let hello = json!({
        "type": "connection_established",
        "dream_id": dream_id,
        "message": "connected; waiting for image status updates",
    });
    if !send_json(&mut socket, &hello).await {
        state.image_events.unsubscribe(dream_id).await;
        return;
    }

    let mut ping_interval = tokio::time::interval(SERVER_PING_INTERVAL);
    ping_interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                let ping = json!({ "type": "ping", "timestamp": now_secs() });
                if !send_json(&mut socket, &ping).await {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_value(&event) else { continue };
                        if !send_json(&mut socket, &payload).await {
                            break;
                        }
                    }
                    // Fell behind the broadcast buffer; skip to current
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_message(&mut socket, &state, dream_id, text.as_str()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.image_events.unsubscribe(dream_id).await;
}

async fn handle_client_message(
    socket: &mut WebSocket,
    state: &AppState,
    dream_id: Uuid,
    text: &str,
) -> bool {
    let message_type = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));

    match message_type.as_deref() {
        Some("ping") => {
            send_json(socket, &json!({ "type": "pong", "timestamp": now_secs() })).await
        }
        Some("request_status") => {
            let images: Vec<ImagePayload> = match dreams::image_snapshot(state, dream_id).await {
                Ok(images) => images,
                Err(err) => {
                    tracing::warn!(dream_id = %dream_id, error = %err, "status snapshot failed");
                    return send_json(
                        socket,
                        &json!({ "type": "error", "message": "could not load status" }),
                    )
                    .await;
                }
            };
            let snapshot = json!({
                "type": "image_update",
                "dream_id": dream_id,
                "images": images,
                "status": ImageEventStatus::Completed,
                "timestamp": now_secs(),
            });
            send_json(socket, &snapshot).await
        }
        Some(other) => {
            send_json(
                socket,
                &json!({ "type": "error", "message": format!("unknown message type: {other}") }),
            )
            .await
        }
        None => {
            send_json(socket, &json!({ "type": "error", "message": "malformed message" })).await
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
