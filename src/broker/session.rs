//! One WebSocket connection as seen by application code.
//!
//! A [`Session`] owns the receiving end of its inbound queue and shares the
//! rest of its state ([`SessionShared`]) with the broker's registry and its
//! two pumps. The lifecycle is published through a `watch` channel so the
//! pumps and [`Session::receive_message`] observe closing without polling.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use super::hub::{Command, ControlLink};
use crate::domain::{Frame, SessionId, SessionState};
use crate::error::BrokerError;

/// Why an outbound frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    Full,
    Closed,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("outbound queue full"),
            Self::Closed => f.write_str("outbound queue closed"),
        }
    }
}

/// State shared between a session handle, the registry and the pumps.
#[derive(Debug)]
pub(crate) struct SessionShared {
    id: watch::Sender<SessionId>,
    state: watch::Sender<SessionState>,
    outbound: mpsc::Sender<Bytes>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: watch::Sender::new(id),
            state: watch::Sender::new(SessionState::Upgrading),
            outbound,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id.borrow().clone()
    }

    /// Only the control loop renames, so the registry key and this value
    /// never disagree between commands.
    pub(crate) fn set_id(&self, id: SessionId) {
        self.id.send_replace(id);
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Moves the lifecycle forward. Returns `false` if `next` is not ahead
    /// of the current state.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Starts closing. Returns `true` only for the call that actually
    /// started it.
    pub(crate) fn begin_draining(&self) -> bool {
        self.advance(SessionState::Draining)
    }

    pub(crate) fn try_enqueue(&self, encoded: Bytes) -> Result<(), EnqueueError> {
        self.outbound.try_send(encoded).map_err(|err| match err {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Resolves once the observed state is [`SessionState::Draining`] or later.
pub(crate) async fn wait_closing(state: &mut watch::Receiver<SessionState>) {
    // An error means the sender is gone, which only happens once the
    // session itself has been dropped.
    let _ = state.wait_for(|s| s.is_closing()).await;
}

/// Application handle to a connected client.
///
/// Obtained from [`crate::broker::Broker::upgrade`]. Dropping the handle
/// closes the connection.
pub struct Session {
    shared: Arc<SessionShared>,
    inbound: Mutex<mpsc::Receiver<Frame>>,
    link: ControlLink,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id())
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        inbound: mpsc::Receiver<Frame>,
        link: ControlLink,
    ) -> Self {
        Self {
            shared,
            inbound: Mutex::new(inbound),
            link,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Current registry id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Queues a text message for this client without blocking.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::InvalidTextEncoding`] if `payload` is not UTF-8.
    /// - [`BrokerError::ConnectionClosing`] if the outbound queue is full;
    ///   the session is evicted.
    /// - [`BrokerError::Disconnected`] if the session is already closing.
    pub fn send_message(&self, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        self.send_frame(Frame::text(payload)?)
    }

    /// Queues a binary message for this client without blocking.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send_message`], minus the encoding check.
    pub fn send_binary_message(&self, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        self.send_frame(Frame::binary(payload))
    }

    fn send_frame(&self, frame: Frame) -> Result<(), BrokerError> {
        if self.shared.state().is_closing() {
            return Err(BrokerError::Disconnected(self.id()));
        }
        match self.shared.try_enqueue(frame.encode()) {
            Ok(()) => Ok(()),
            Err(EnqueueError::Full) => {
                let id = self.id();
                tracing::warn!(session_id = %id, "outbound queue full, evicting session");
                self.shared.begin_draining();
                self.link.request_unregister(&self.shared);
                Err(BrokerError::ConnectionClosing(id))
            }
            Err(EnqueueError::Closed) => Err(BrokerError::Disconnected(self.id())),
        }
    }

    /// Waits for the next message from this client.
    ///
    /// Messages are returned in the order the client sent them. Once the
    /// session is closing this returns [`BrokerError::Disconnected`]
    /// immediately, and on every later call, even if undelivered messages
    /// remain queued.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Disconnected`] once the session is closing.
    pub async fn receive_message(&self) -> Result<Frame, BrokerError> {
        let mut state = self.shared.subscribe_state();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            () = wait_closing(&mut state) => Err(BrokerError::Disconnected(self.id())),
            frame = inbound.recv() => frame.ok_or_else(|| BrokerError::Disconnected(self.id())),
        }
    }

    /// Re-keys this session in the broker's registry.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::EmptyId`] if `new_id` is empty.
    /// - [`BrokerError::DuplicateId`] if another member already uses it.
    /// - [`BrokerError::Disconnected`] if this session is no longer a
    ///   member.
    /// - [`BrokerError::BrokerBusy`] / [`BrokerError::BrokerUnavailable`]
    ///   if the broker cannot take the request.
    pub async fn change_id(&self, new_id: &str) -> Result<(), BrokerError> {
        let new_id = SessionId::new(new_id)?;
        let (reply, rx) = oneshot::channel();
        self.link
            .submit(Command::Rename {
                session: Arc::clone(&self.shared),
                new_id,
                reply,
            })
            .await?;
        rx.await.map_err(|_| BrokerError::BrokerUnavailable)?
    }

    /// Closes the connection and deregisters the session.
    ///
    /// Safe to call more than once. The connection is closed even if the
    /// deregistration request could not be delivered.
    ///
    /// # Errors
    ///
    /// [`BrokerError::BrokerBusy`] if the broker's control queue stayed full;
    /// the pumps retry the deregistration when they exit.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.shared.begin_draining() {
            tracing::debug!(session_id = %self.id(), "session close requested");
        }
        let result = self
            .link
            .submit(Command::Unregister {
                session: Arc::clone(&self.shared),
            })
            .await;
        match result {
            Err(BrokerError::BrokerUnavailable) => Ok(()),
            other => other,
        }
    }

    /// Waits until both pumps have exited and the transport is released.
    pub async fn closed(&self) {
        let mut state = self.shared.subscribe_state();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.begin_draining();
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use axum::extract::ws::Message;

    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::domain::MessageKind;
    use crate::transport::memory::{self, Peer};

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            write_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(200),
            ..BrokerConfig::default()
        }
    }

    async fn connect(broker: &Broker, id: &str) -> (Session, Peer) {
        let (transport, peer) = memory::pair();
        let Ok(id) = SessionId::new(id) else {
            panic!("valid id");
        };
        let Ok(session) = broker.upgrade(transport, id).await else {
            panic!("upgrade failed");
        };
        (session, peer)
    }

    async fn receive(session: &Session) -> Result<Frame, BrokerError> {
        let Ok(result) =
            tokio::time::timeout(Duration::from_secs(2), session.receive_message()).await
        else {
            panic!("receive_message timed out");
        };
        result
    }

    #[test]
    fn state_only_moves_forward() {
        let (tx, _rx) = mpsc::channel(1);
        let Ok(id) = SessionId::new("A") else {
            panic!("valid id");
        };
        let shared = SessionShared::new(id, tx);
        assert!(shared.advance(SessionState::Active));
        assert!(shared.begin_draining());
        assert!(!shared.begin_draining());
        assert!(!shared.advance(SessionState::Active));
        assert!(shared.advance(SessionState::Closed));
        assert_eq!(shared.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn client_messages_arrive_in_order() {
        let broker = Broker::new(test_config());
        let (session, peer) = connect(&broker, "A").await;

        for text in ["one", "two"] {
            assert!(peer.to_session.send(Message::text(text)).await.is_ok());
        }
        assert!(
            peer.to_session
                .send(Message::Binary(Bytes::from_static(b"\x00\x01")))
                .await
                .is_ok()
        );

        let Ok(first) = receive(&session).await else {
            panic!("first message missing");
        };
        assert_eq!(first.as_text(), Some("one"));
        let Ok(second) = receive(&session).await else {
            panic!("second message missing");
        };
        assert_eq!(second.as_text(), Some("two"));
        let Ok(third) = receive(&session).await else {
            panic!("third message missing");
        };
        assert_eq!(third.kind(), MessageKind::Binary);
        assert_eq!(third.payload(), &Bytes::from_static(b"\x00\x01"));
    }

    #[tokio::test]
    async fn send_message_reaches_peer() {
        let broker = Broker::new(test_config());
        let (session, mut peer) = connect(&broker, "A").await;

        assert!(session.send_message("hello").is_ok());
        let received = tokio::time::timeout(Duration::from_secs(2), peer.next_data()).await;
        let Ok(Some(Message::Text(text))) = received else {
            panic!("expected text, got {received:?}");
        };
        assert_eq!(text.as_str(), "hello");
    }

    #[tokio::test]
    async fn send_message_rejects_invalid_utf8() {
        let broker = Broker::new(test_config());
        let (session, _peer) = connect(&broker, "A").await;
        let result = session.send_message(vec![0xC3u8, 0x28]);
        assert!(matches!(result, Err(BrokerError::InvalidTextEncoding)));
    }

    #[tokio::test]
    async fn receive_after_close_is_disconnected_every_time() {
        let broker = Broker::new(test_config());
        let (session, peer) = connect(&broker, "A").await;
        assert!(peer.to_session.send(Message::text("queued")).await.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.close().await.is_ok());

        for _ in 0..3 {
            assert!(matches!(
                receive(&session).await,
                Err(BrokerError::Disconnected(_))
            ));
        }
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let broker = Broker::new(test_config());
        let (session, _peer) = connect(&broker, "A").await;
        assert!(session.close().await.is_ok());
        assert!(session.close().await.is_ok());
        assert!(matches!(
            session.send_message("late"),
            Err(BrokerError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_reaches_closed_state() {
        let broker = Broker::new(test_config());
        let (session, mut peer) = connect(&broker, "A").await;
        assert!(session.send_message("bye").is_ok());
        assert!(session.close().await.is_ok());

        let Ok(()) = tokio::time::timeout(Duration::from_secs(2), session.closed()).await else {
            panic!("session never reached Closed");
        };
        assert_eq!(session.state(), SessionState::Closed);

        let mut saw_close = false;
        while let Some(message) = peer.from_session.recv().await {
            if matches!(message, Message::Close(_)) {
                saw_close = true;
            }
        }
        assert!(saw_close, "peer should see a close frame");
    }

    #[tokio::test]
    async fn peer_close_disconnects_session() {
        let broker = Broker::new(test_config());
        let (session, peer) = connect(&broker, "A").await;
        assert!(peer.to_session.send(Message::Close(None)).await.is_ok());

        assert!(matches!(
            receive(&session).await,
            Err(BrokerError::Disconnected(_))
        ));
        let Ok(()) = tokio::time::timeout(Duration::from_secs(2), session.closed()).await else {
            panic!("session never reached Closed");
        };
        assert!(matches!(broker.member_count().await, Ok(0)));
    }

    #[tokio::test]
    async fn dropping_session_deregisters_it() {
        let broker = Broker::new(test_config());
        let (session, _peer) = connect(&broker, "A").await;
        drop(session);

        let mut remaining = usize::MAX;
        for _ in 0..50 {
            if let Ok(count) = broker.member_count().await {
                remaining = count;
            }
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn debug_shows_id_and_state() {
        let broker = Broker::new(test_config());
        let (session, _peer) = connect(&broker, "A").await;
        let rendered = format!("{session:?}");
        assert!(rendered.contains("\"A\""));
        assert!(rendered.contains("Active"));
    }
}
