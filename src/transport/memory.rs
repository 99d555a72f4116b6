//! In-memory transport for broker and session tests.
//!
//! [`pair`] returns a transport for the session side and a [`Peer`] that
//! plays the remote client. [`stalled_pair`] returns a transport whose
//! writes never complete, which models a peer that stopped reading.

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportReader, TransportWriter};

const PEER_BUFFER: usize = 1024;

/// Session side of an in-memory connection.
#[derive(Debug)]
pub(crate) struct MemoryTransport {
    reader: MemoryReader,
    writer: MemoryWriter,
}

/// Receiving half of a [`MemoryTransport`].
#[derive(Debug)]
pub(crate) struct MemoryReader {
    rx: mpsc::Receiver<Message>,
}

/// Sending half of a [`MemoryTransport`].
#[derive(Debug)]
pub(crate) struct MemoryWriter {
    tx: mpsc::Sender<Message>,
    stalled: bool,
}

/// Remote client side of an in-memory connection.
#[derive(Debug)]
pub(crate) struct Peer {
    /// Messages the client sends to the session.
    pub(crate) to_session: mpsc::Sender<Message>,
    /// Messages the session wrote to the client.
    pub(crate) from_session: mpsc::Receiver<Message>,
}

impl Peer {
    /// Waits for the next data message, skipping keepalive pings.
    pub(crate) async fn next_data(&mut self) -> Option<Message> {
        loop {
            match self.from_session.recv().await? {
                Message::Ping(_) | Message::Pong(_) => continue,
                other => return Some(other),
            }
        }
    }
}

pub(crate) fn pair() -> (MemoryTransport, Peer) {
    build(false)
}

pub(crate) fn stalled_pair() -> (MemoryTransport, Peer) {
    build(true)
}

fn build(stalled: bool) -> (MemoryTransport, Peer) {
    let (to_session, session_rx) = mpsc::channel(PEER_BUFFER);
    let (session_tx, from_session) = mpsc::channel(PEER_BUFFER);
    (
        MemoryTransport {
            reader: MemoryReader { rx: session_rx },
            writer: MemoryWriter {
                tx: session_tx,
                stalled,
            },
        },
        Peer {
            to_session,
            from_session,
        },
    )
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

impl TransportReader for MemoryReader {
    async fn read_message(&mut self) -> Option<Result<Message, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl TransportWriter for MemoryWriter {
    async fn write_message(&mut self, message: Message) -> Result<(), TransportError> {
        if self.stalled {
            return std::future::pending().await;
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
