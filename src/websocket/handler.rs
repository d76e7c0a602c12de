use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use crate::{middleware::AuthUser, state::AppState, user::UserProfile};

use super::types::WsMessage;

/// Realtime messaging socket.
///
/// Authentication happens in `auth_middleware` before the upgrade, so a
/// rejected handshake never registers a session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: UserProfile, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let gateway = state.gateway.clone();
    let (session, mut rx) = gateway.connect(user).await;

    // Task: send events from the session channel to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode realtime event: {}", e),
            }
        }
    });

    // Task: receive frames from the socket
    let recv_gateway = gateway.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => recv_gateway.handle_text(&recv_session, &text).await,
                Message::Close(_) => break,
                // axum answers protocol pings itself; binary frames are not part of the protocol
                _ => {}
            }
        }
    });

    // Heartbeat task: pings the client and renews the presence lease
    let heartbeat_gateway = gateway.clone();
    let heartbeat_session = session.clone();
    let period = state.config.heartbeat_period();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            heartbeat_gateway
                .connections()
                .send_to_session(heartbeat_session.session_id, WsMessage::Ping);
            heartbeat_gateway.refresh_presence(&heartbeat_session).await;
        }
    });

    // Stop all tasks when any one finishes. A send_message in flight keeps
    // running in the gateway after recv_task is aborted.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            heartbeat_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
            heartbeat_task.abort();
        },
        _ = &mut heartbeat_task => {
            send_task.abort();
            recv_task.abort();
        }
    }

    gateway.disconnect(&session).await;
}
