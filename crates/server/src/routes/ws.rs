//! Realtime endpoint: `GET /api/ws`.
//!
//! Clients authenticate once, then manage project subscriptions with
//! `{"action": "subscribe" | "unsubscribe", "projects": [...]}` and receive
//! event envelopes for the projects they follow.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::auth::{bearer_token, validate_access_token};
use crate::state::AppState;

/// How long an unauthenticated client may take to send its auth message.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: Option<String>,
    #[serde(default)]
    projects: Value,
    #[serde(default)]
    token: Option<String>,
}

/// Project ids trimmed, blanks and non-strings dropped, deduplicated.
fn normalize_projects(raw: &Value) -> Vec<String> {
    let Value::Array(items) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn error_message(message: &str) -> String {
    json!({"type": "error", "message": message}).to_string()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(query.token.filter(|t| !t.is_empty()));
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

type Sink = SplitSink<WebSocket, Message>;

async fn reject(sink: &mut Sink, message: &str) {
    let _ = sink.send(Message::Text(error_message(message).into())).await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: message.to_string().into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let secret = state.settings.secret_key.as_str();

    match token {
        Some(token) => {
            if validate_access_token(&token, secret).is_err() {
                reject(&mut sink, "Invalid access token").await;
                return;
            }
        }
        None => {
            // First message must be auth
            let first = match tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => text,
                Ok(Some(Ok(_))) | Err(_) => {
                    reject(&mut sink, "First message must be auth").await;
                    return;
                }
                Ok(None) | Ok(Some(Err(_))) => return,
            };
            let token = serde_json::from_str::<ClientMessage>(&first)
                .ok()
                .filter(|m| m.action.as_deref() == Some("auth"))
                .and_then(|m| m.token);
            let Some(token) = token else {
                reject(&mut sink, "First message must be auth").await;
                return;
            };
            if validate_access_token(&token, secret).is_err() {
                reject(&mut sink, "Invalid access token").await;
                return;
            }
            if sink
                .send(Message::Text(json!({"type": "auth_ok"}).to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    let (conn_id, mut rx) = state.hub.connect();
    info!(connection = %conn_id, "Realtime client authenticated");

    // Spawn task to forward queued messages to WS sink
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Err(_) => Some(error_message("Invalid message")),
            Ok(message) => match message.action.as_deref() {
                Some("subscribe") => {
                    let projects = normalize_projects(&message.projects);
                    debug!(connection = %conn_id, count = projects.len(), "Subscribe");
                    state.hub.subscribe(conn_id, &projects);
                    None
                }
                Some("unsubscribe") => {
                    state
                        .hub
                        .unsubscribe(conn_id, &normalize_projects(&message.projects));
                    None
                }
                Some("ping") => Some(json!({"type": "pong"}).to_string()),
                _ => Some(error_message("Unknown action")),
            },
        };
        if let Some(reply) = reply {
            if !state.hub.send(conn_id, reply) {
                break;
            }
        }
    }

    state.hub.disconnect(conn_id);
    forward_task.abort();
    info!(connection = %conn_id, "Realtime client disconnected");
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}
