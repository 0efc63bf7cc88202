//! Event Bus transport (§4.8): a single `/ws` upgrade that joins the caller's
//! own user room. The bearer token travels as a `?token=` query parameter
//! since browser `WebSocket` clients cannot set an `Authorization` header on
//! the upgrade request; the server resolves it to a `user_id` exactly once,
//! at handshake time, and every event forwarded afterwards is filtered by
//! [`crate::event_bus::UserSubscription::recv_for`] — there is no
//! "subscribe to instance X" primitive, so cross-user leakage is structurally
//! unrepresentable rather than merely checked.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::auth::resolve_ws_user;
use crate::api::state::AppState;
use crate::domain::User;
use crate::event_bus::{InstanceEvent, RelayHealthEvent};

/// Wraps the two event shapes the socket can forward: per-user instance
/// transitions, and (for `is_admin` accounts only) relay health transitions
/// from the sweeper's relay prober (§4.9).
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WsOutboundEvent {
    InstanceTransition(InstanceEvent),
    RelayHealth(RelayHealthEvent),
}

#[derive(Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
) -> Response {
    let Some(token) = query.token else {
        return (StatusCode::UNAUTHORIZED, "missing ?token=").into_response();
    };

    match resolve_ws_user(&state, &token).await {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(socket, state, user)),
        Err(e) => e.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = user.id;
    let mut subscription = state.event_bus.subscribe();
    let mut admin_subscription = user.is_admin.then(|| state.event_bus.subscribe_admin());
    debug!(%user_id, is_admin = user.is_admin, "websocket: user room joined");

    let forward_task = tokio::spawn(async move {
        loop {
            let outbound = match &mut admin_subscription {
                Some(admin_sub) => {
                    tokio::select! {
                        biased;
                        event = subscription.recv_for(user_id) => event.map(WsOutboundEvent::InstanceTransition),
                        event = admin_sub.recv() => event.map(WsOutboundEvent::RelayHealth),
                    }
                }
                None => subscription.recv_for(user_id).await.map(WsOutboundEvent::InstanceTransition),
            };
            let Some(outbound) = outbound else { break };

            let payload = match serde_json::to_string(&outbound) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "websocket: failed to serialize event");
                    continue;
                }
            };
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    forward_task.abort();
    debug!(%user_id, "websocket: user room left");
}
