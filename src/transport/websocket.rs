//! [`Transport`] implementation for axum's WebSocket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use super::{Transport, TransportError, TransportReader, TransportWriter};

impl Transport for WebSocket {
    type Reader = SplitStream<WebSocket>;
    type Writer = SplitSink<WebSocket, Message>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = StreamExt::split(self);
        (stream, sink)
    }
}

impl TransportReader for SplitStream<WebSocket> {
    async fn read_message(&mut self) -> Option<Result<Message, TransportError>> {
        self.next().await.map(|r| r.map_err(TransportError::from))
    }
}

impl TransportWriter for SplitSink<WebSocket, Message> {
    async fn write_message(&mut self, message: Message) -> Result<(), TransportError> {
        SinkExt::send(self, message).await.map_err(TransportError::from)
    }
}
