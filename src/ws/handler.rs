//! Axum WebSocket upgrade handler.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Deserialize;

use super::chat;
use crate::app_state::AppState;
use crate::domain::SessionId;
use crate::error::BrokerError;

/// Query parameters accepted by `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    /// Preferred session id. Defaults to `CID-<peer-address>-<unix-ts>`.
    pub id: Option<String>,
}

/// `GET /ws`: Upgrade HTTP connection to WebSocket and join the chat.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let broker = state.broker.clone();

    ws.on_failed_upgrade(move |err: axum::Error| {
        let err = BrokerError::UpgradeFailed(err.to_string());
        tracing::warn!(peer = %peer, code = err.error_code(), error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        let default_id = SessionId::from_peer(&peer, Utc::now());
        let session = match broker.upgrade(socket, default_id).await {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(peer = %peer, code = err.error_code(), error = %err, "failed to register session");
                return;
            }
        };

        if let Some(preferred) = params.id.as_deref().filter(|id| !id.is_empty())
            && let Err(err) = session.change_id(preferred).await
        {
            tracing::warn!(
                session_id = %session.id(),
                requested = preferred,
                error = %err,
                "failed to change client id"
            );
        }

        chat::run(&broker, session).await;
    })
}
