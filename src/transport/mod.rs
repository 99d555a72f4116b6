//! Transport adapter: a duplex stream of discrete WebSocket messages.
//!
//! A [`Transport`] splits into a [`TransportReader`] owned by the session's
//! inbound pump and a [`TransportWriter`] owned by its outbound pump. The
//! pumps layer deadlines on top (`tokio::time::timeout`), so implementations
//! only move messages.
//!
//! The production implementation is axum's [`axum::extract::ws::WebSocket`]
//! (see [`websocket`]).

use std::future::Future;

use axum::extract::ws::Message;

pub mod websocket;

#[cfg(test)]
pub(crate) mod memory;

/// Transport-level failure. Absorbed by the session pumps; never returned
/// to callers of the broker API.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Error reported by the underlying WebSocket.
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    /// The peer side of the transport is gone.
    #[error("transport closed")]
    Closed,
}

/// A raw duplex message channel handed to the broker at upgrade time.
pub trait Transport: Send + 'static {
    /// Receiving half.
    type Reader: TransportReader;
    /// Sending half.
    type Writer: TransportWriter;

    /// Splits the transport into independently owned halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Receiving half of a [`Transport`].
pub trait TransportReader: Send + 'static {
    /// Reads the next message. `None` means the stream has ended.
    fn read_message(
        &mut self,
    ) -> impl Future<Output = Option<Result<Message, TransportError>>> + Send;
}

/// Sending half of a [`Transport`].
pub trait TransportWriter: Send + 'static {
    /// Writes one message, flushing it to the peer.
    fn write_message(
        &mut self,
        message: Message,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
