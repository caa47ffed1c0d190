//! Real-time notification hub.
//!
//! Every connection belongs to two groups, `user:{id}` and `role:{name}`.
//! Messages go out over one broadcast channel and each connection keeps
//! only what is addressed to one of its groups.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth_context::{authorize, AuthContext};
use crate::models::AppState;

const HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubTarget {
    User(Uuid),
    Role(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub notification_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub appointment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HubMessage {
    pub target: HubTarget,
    pub payload: NotificationPayload,
}

impl HubMessage {
    pub fn is_for(&self, user_id: Uuid, role: &str) -> bool {
        match &self.target {
            HubTarget::User(id) => *id == user_id,
            HubTarget::Role(name) => name.eq_ignore_ascii_case(role),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: &'a NotificationPayload,
}

#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<HubMessage>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Returns how many live connections received the message.
    pub fn publish(&self, message: HubMessage) -> usize {
        // Err only means nobody is connected.
        self.tx.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }

    pub fn connections(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/hubs/notifications", get(connect))
}

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    pub access_token: String,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(q): Query<HubQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &q.access_token).await?;
    let rx = state.hub.subscribe();
    tracing::debug!(connections = state.hub.connections(), "hub subscriber added");
    Ok(ws.on_upgrade(move |socket| serve_connection(socket, auth, rx)))
}

async fn serve_connection(
    mut socket: WebSocket,
    auth: AuthContext,
    mut rx: broadcast::Receiver<HubMessage>,
) {
    tracing::info!(user_id = %auth.user_id, role = %auth.role, "hub connection opened");

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(msg) if msg.is_for(auth.user_id, &auth.role) => {
                    let envelope = Envelope { kind: "ReceiveNotification", payload: &msg.payload };
                    let text = match serde_json::to_string(&envelope) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode hub message");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(user_id = %auth.user_id, skipped, "hub connection lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(user_id = %auth.user_id, "hub connection closed");
}
