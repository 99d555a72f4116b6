//! Demo chat served on `/ws`.
//!
//! Clients type plain lines. Two prefixes are commands:
//!
//! - `/ALL <text>` (or `/all`) broadcasts `<text>` to every connected client
//!   and is not echoed back;
//! - `/CID-<id> <text>` sends `<text>` to the client registered as
//!   `CID-<id>`.
//!
//! Everything else, including `/CID-` lines, is echoed back as
//! `You: <line>`.

use super::messages::{ADMIN_SENDER, ChatMessage, EMPTY_BODY};
use crate::broker::{Broker, Session};
use crate::domain::{MessageKind, SessionId};
use crate::error::BrokerError;

const HELP_BROADCAST: &str = "[!] Use /ALL <message> to broadcast a message to all clients";
const HELP_DIRECT: &str = "[!] Use /CID-<client_id> <message> to send a message to a specific client";

/// A parsed client line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand<'a> {
    /// Fan out `content` to every member.
    Broadcast {
        /// Text after the command word.
        content: &'a str,
    },
    /// Deliver `content` to the member registered as `to`.
    Direct {
        /// Recipient id, without the leading `/`.
        to: &'a str,
        /// Text after the command word.
        content: &'a str,
    },
    /// Ordinary line.
    Plain,
}

impl<'a> ChatCommand<'a> {
    /// Classifies a line typed by a client.
    #[must_use]
    pub fn parse(line: &'a str) -> Self {
        if line.starts_with("/ALL") || line.starts_with("/all") {
            let content = line.split_once(' ').map_or(EMPTY_BODY, |(_, rest)| rest);
            return Self::Broadcast { content };
        }
        if let Some(target) = line.strip_prefix('/').filter(|t| t.starts_with("CID-")) {
            let (to, content) = target.split_once(' ').unwrap_or((target, ""));
            let content = if content.is_empty() { EMPTY_BODY } else { content };
            return Self::Direct { to, content };
        }
        Self::Plain
    }
}

fn send_greeting(session: &Session) -> Result<(), BrokerError> {
    let id = session.id();
    session.send_message(ChatMessage::welcome(id.as_str()).to_json())?;
    session.send_message(ChatMessage::chat(ADMIN_SENDER, HELP_BROADCAST).to_json())?;
    session.send_message(ChatMessage::chat(ADMIN_SENDER, HELP_DIRECT).to_json())
}

async fn send_direct(
    broker: &Broker,
    from: &SessionId,
    to: &str,
    content: &str,
) -> Result<(), BrokerError> {
    let to = SessionId::new(to)?;
    tracing::debug!(from = %from, to = %to, "direct message");
    let body = ChatMessage::chat(from.as_str(), content).to_json();
    broker.send_to(&to, MessageKind::Text, body).await
}

/// Runs the chat loop for one client until it disconnects, then closes the
/// session.
pub async fn run(broker: &Broker, session: Session) {
    if let Err(err) = send_greeting(&session) {
        tracing::warn!(session_id = %session.id(), error = %err, "failed to send welcome message");
        let _ = session.close().await;
        return;
    }
    tracing::info!(session_id = %session.id(), "client connected");

    loop {
        let frame = match session.receive_message().await {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(session_id = %session.id(), error = %err, "receive ended");
                break;
            }
        };
        let line = String::from_utf8_lossy(frame.payload());
        let id = session.id();

        let mut reply = format!("You: {line}");
        match ChatCommand::parse(&line) {
            ChatCommand::Broadcast { content } => {
                let body = ChatMessage::chat(id.as_str(), content).to_json();
                if let Err(err) = broker.broadcast_text(body).await {
                    tracing::warn!(session_id = %id, error = %err, "broadcast failed");
                    break;
                }
                continue;
            }
            ChatCommand::Direct { to, content } => {
                if let Err(err) = send_direct(broker, &id, to, content).await {
                    tracing::warn!(session_id = %id, to, error = %err, "direct message failed");
                    reply.push_str(&format!(
                        " - Failed to send message to client {to} because receiver is not connected (detail: {err})"
                    ));
                }
            }
            ChatCommand::Plain => {}
        }

        if let Err(err) = session.send_message(reply) {
            tracing::warn!(session_id = %id, error = %err, "echo failed");
            break;
        }
    }

    tracing::info!(session_id = %session.id(), "client disconnected");
    if let Err(err) = session.close().await {
        tracing::warn!(session_id = %session.id(), error = %err, "failed to close session");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use axum::extract::ws::Message;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::transport::memory::{self, Peer};

    #[test]
    fn parses_broadcast_with_and_without_body() {
        assert_eq!(
            ChatCommand::parse("/ALL hello there"),
            ChatCommand::Broadcast {
                content: "hello there"
            }
        );
        assert_eq!(
            ChatCommand::parse("/all"),
            ChatCommand::Broadcast {
                content: EMPTY_BODY
            }
        );
    }

    #[test]
    fn parses_direct_message() {
        assert_eq!(
            ChatCommand::parse("/CID-bob hi bob"),
            ChatCommand::Direct {
                to: "CID-bob",
                content: "hi bob"
            }
        );
        assert_eq!(
            ChatCommand::parse("/CID-bob"),
            ChatCommand::Direct {
                to: "CID-bob",
                content: EMPTY_BODY
            }
        );
    }

    #[test]
    fn other_lines_are_plain() {
        assert_eq!(ChatCommand::parse("hello"), ChatCommand::Plain);
        assert_eq!(ChatCommand::parse("/cid-lowercase x"), ChatCommand::Plain);
    }

    async fn next_json(peer: &mut Peer) -> serde_json::Value {
        let received = tokio::time::timeout(Duration::from_secs(2), peer.next_data()).await;
        let Ok(Some(Message::Text(text))) = received else {
            panic!("expected text, got {received:?}");
        };
        let Ok(value) = serde_json::from_str(text.as_str()) else {
            panic!("not json: {}", text.as_str());
        };
        value
    }

    async fn next_text(peer: &mut Peer) -> String {
        let received = tokio::time::timeout(Duration::from_secs(2), peer.next_data()).await;
        let Ok(Some(Message::Text(text))) = received else {
            panic!("expected text, got {received:?}");
        };
        text.as_str().to_owned()
    }

    async fn join(broker: &Broker, id: &str) -> Peer {
        let (transport, mut peer) = memory::pair();
        let Ok(id) = SessionId::new(id) else {
            panic!("valid id");
        };
        let Ok(session) = broker.upgrade(transport, id).await else {
            panic!("upgrade failed");
        };
        let broker = broker.clone();
        tokio::spawn(async move { run(&broker, session).await });
        // Skip the greeting.
        for _ in 0..3 {
            let _ = next_json(&mut peer).await;
        }
        peer
    }

    #[tokio::test]
    async fn greets_then_echoes() {
        let broker = Broker::new(BrokerConfig::default());
        let (transport, mut peer) = memory::pair();
        let Ok(id) = SessionId::new("CID-me") else {
            panic!("valid id");
        };
        let Ok(session) = broker.upgrade(transport, id).await else {
            panic!("upgrade failed");
        };
        let chat_broker = broker.clone();
        tokio::spawn(async move { run(&chat_broker, session).await });

        let welcome = next_json(&mut peer).await;
        assert_eq!(welcome["type"], "welcome");
        let help = next_json(&mut peer).await;
        assert_eq!(help["from"], ADMIN_SENDER);
        assert_eq!(help["content"], HELP_BROADCAST);
        let help = next_json(&mut peer).await;
        assert_eq!(help["content"], HELP_DIRECT);

        assert!(peer.to_session.send(Message::text("ping")).await.is_ok());
        assert_eq!(next_text(&mut peer).await, "You: ping");
    }

    #[tokio::test]
    async fn broadcast_is_not_echoed_to_sender() {
        let broker = Broker::new(BrokerConfig::default());
        let mut alice = join(&broker, "CID-alice").await;
        let mut bob = join(&broker, "CID-bob").await;

        assert!(alice.to_session.send(Message::text("/ALL hey")).await.is_ok());

        let at_bob = next_json(&mut bob).await;
        assert_eq!(at_bob["from"], "CID-alice");
        assert_eq!(at_bob["content"], "hey");
        let at_alice = next_json(&mut alice).await;
        assert_eq!(at_alice["content"], "hey");

        assert!(alice.to_session.send(Message::text("after")).await.is_ok());
        assert_eq!(next_text(&mut alice).await, "You: after");
    }

    #[tokio::test]
    async fn direct_message_reaches_target_and_is_echoed() {
        let broker = Broker::new(BrokerConfig::default());
        let mut alice = join(&broker, "CID-alice").await;
        let mut bob = join(&broker, "CID-bob").await;

        assert!(
            alice
                .to_session
                .send(Message::text("/CID-bob psst"))
                .await
                .is_ok()
        );

        let at_bob = next_json(&mut bob).await;
        assert_eq!(at_bob["from"], "CID-alice");
        assert_eq!(at_bob["content"], "psst");
        assert_eq!(next_text(&mut alice).await, "You: /CID-bob psst");
    }

    #[tokio::test]
    async fn direct_message_to_unknown_client_reports_failure() {
        let broker = Broker::new(BrokerConfig::default());
        let mut alice = join(&broker, "CID-alice").await;

        assert!(
            alice
                .to_session
                .send(Message::text("/CID-ghost boo"))
                .await
                .is_ok()
        );

        let echo = next_text(&mut alice).await;
        assert!(echo.starts_with(
            "You: /CID-ghost boo - Failed to send message to client CID-ghost because receiver is not connected (detail: "
        ));
        assert!(echo.contains("CID-ghost"));
    }
}
