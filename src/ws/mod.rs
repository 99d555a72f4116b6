//! WebSocket layer: upgrade endpoint and the demo chat built on the broker.
//!
//! `GET /ws?id=<preferred>` upgrades the connection, registers it with the
//! broker and runs [`chat::run`] until the client leaves. `GET /` serves a
//! small browser page for trying it out.

pub mod chat;
pub mod handler;
pub mod messages;
pub mod page;

use axum::Router;
use axum::routing::get;

use crate::app_state::AppState;

/// WebSocket and chat page routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(page::chat_page))
        .route("/ws", get(handler::ws_handler))
}
