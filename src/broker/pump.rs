//! Per-session I/O tasks.
//!
//! Each session runs two pumps and a supervisor:
//!
//! - the inbound pump reads from the transport under a read deadline that
//!   is renewed on every pong, and forwards data messages to the inbound
//!   queue;
//! - the outbound pump drains the outbound queue into the transport and
//!   sends keepalive pings;
//! - the supervisor waits for both and marks the session `Closed`.
//!
//! Either pump exiting for any reason moves the session to `Draining`,
//! which stops the other, and asks the broker to deregister it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};

use super::hub::ControlLink;
use super::session::{SessionShared, wait_closing};
use crate::config::BrokerConfig;
use crate::domain::{Frame, MessageKind, SessionState};
use crate::error::BrokerError;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Everything a pump needs besides its half of the transport.
#[derive(Debug, Clone)]
struct PumpContext {
    shared: Arc<SessionShared>,
    link: ControlLink,
    config: Arc<BrokerConfig>,
}

impl PumpContext {
    fn finish(&self, pump: &'static str, reason: &'static str) {
        tracing::debug!(session_id = %self.shared.id(), pump, reason, "pump stopped");
        self.shared.begin_draining();
        self.link.request_unregister(&self.shared);
    }
}

/// Splits `transport` and spawns both pumps plus their supervisor.
pub(crate) fn spawn<T: Transport>(
    transport: T,
    shared: Arc<SessionShared>,
    inbound: mpsc::Sender<Frame>,
    outbound: mpsc::Receiver<Bytes>,
    link: ControlLink,
    config: Arc<BrokerConfig>,
) {
    let (reader, writer) = transport.split();
    let ctx = PumpContext {
        shared: Arc::clone(&shared),
        link,
        config,
    };

    let reading = tokio::spawn(inbound_pump(reader, inbound, ctx.clone()));
    let writing = tokio::spawn(outbound_pump(writer, outbound, ctx));

    tokio::spawn(async move {
        if let Err(err) = reading.await {
            tracing::warn!(session_id = %shared.id(), error = %err, "inbound pump task failed");
        }
        if let Err(err) = writing.await {
            tracing::warn!(session_id = %shared.id(), error = %err, "outbound pump task failed");
        }
        shared.begin_draining();
        shared.advance(SessionState::Closed);
        tracing::info!(session_id = %shared.id(), "session closed");
    });
}

enum Delivery {
    Queued,
    Dropped,
    Closed,
}

/// Hands a frame to the application, waiting up to `idle` for room.
async fn deliver(inbound: &mpsc::Sender<Frame>, frame: Frame, idle: Duration) -> Delivery {
    match inbound.try_send(frame) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
        Err(TrySendError::Full(frame)) => {
            match tokio::time::timeout(idle, inbound.send(frame)).await {
                Ok(Ok(())) => Delivery::Queued,
                Ok(Err(_)) => Delivery::Closed,
                Err(_) => Delivery::Dropped,
            }
        }
    }
}

fn to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Frame::text(Bytes::copy_from_slice(text.as_str().as_bytes())).ok(),
        Message::Binary(data) => Some(Frame::binary(data)),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

async fn inbound_pump<R: TransportReader>(
    mut reader: R,
    inbound: mpsc::Sender<Frame>,
    ctx: PumpContext,
) {
    let read_timeout = ctx.config.read_timeout;
    let mut state = ctx.shared.subscribe_state();
    let mut deadline = Instant::now() + read_timeout;

    let reason = loop {
        let read = tokio::select! {
            biased;
            () = wait_closing(&mut state) => break "session closing",
            read = tokio::time::timeout_at(deadline, reader.read_message()) => read,
        };

        let message = match read {
            Err(_) => break "read deadline exceeded",
            Ok(None) => break "transport ended",
            Ok(Some(Err(err))) => {
                tracing::warn!(session_id = %ctx.shared.id(), error = %err, "transport read failed");
                break "read error";
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => {
                deadline = Instant::now() + read_timeout;
                continue;
            }
            Message::Close(_) => break "peer closed",
            _ => {}
        }

        let Some(frame) = to_frame(message) else {
            continue;
        };
        tracing::debug!(
            session_id = %ctx.shared.id(),
            kind = %frame.kind(),
            len = frame.payload().len(),
            "message received"
        );

        let delivery = tokio::select! {
            biased;
            () = wait_closing(&mut state) => break "session closing",
            delivery = deliver(&inbound, frame, ctx.config.idle_timeout) => delivery,
        };
        match delivery {
            Delivery::Queued => {}
            Delivery::Dropped => {
                tracing::warn!(
                    session_id = %ctx.shared.id(),
                    "inbound queue full past idle timeout, message dropped"
                );
            }
            Delivery::Closed => break "inbound queue closed",
        }
    };

    ctx.finish("inbound", reason);
}

/// Turns an encoded frame back into a WebSocket message. Frames that do
/// not decode are logged and skipped.
fn to_message(encoded: Bytes) -> Option<Message> {
    let frame = match Frame::decode(encoded) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(error = %err, "skipping undecodable outbound frame");
            return None;
        }
    };
    match frame.kind() {
        MessageKind::Text => frame
            .as_text()
            .map(|text| Message::Text(text.to_owned().into())),
        MessageKind::Binary => Some(Message::Binary(frame.into_payload())),
    }
}

async fn write_with_deadline<W: TransportWriter>(
    writer: &mut W,
    message: Message,
    deadline: Duration,
    shared: &SessionShared,
) -> Result<(), &'static str> {
    match tokio::time::timeout(deadline, writer.write_message(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            tracing::debug!(session_id = %shared.id(), error = %err, "transport write failed");
            Err("write error")
        }
        Err(_) => {
            let err = BrokerError::WriteTimeout;
            tracing::warn!(
                session_id = %shared.id(),
                code = err.error_code(),
                error = %err,
                "transport write timed out"
            );
            Err("write deadline exceeded")
        }
    }
}

/// Flushes what is left in the (already closed) outbound queue, then
/// sends a close frame. The whole drain is bounded by `write_timeout`.
async fn drain_and_close<W: TransportWriter>(
    writer: &mut W,
    outbound: &mut mpsc::Receiver<Bytes>,
    write_timeout: Duration,
    shared: &SessionShared,
) {
    let flush = async {
        while let Some(encoded) = outbound.recv().await {
            let Some(message) = to_message(encoded) else {
                continue;
            };
            if writer.write_message(message).await.is_err() {
                return;
            }
        }
        let _ = writer.write_message(Message::Close(None)).await;
    };
    if tokio::time::timeout(write_timeout, flush).await.is_err() {
        tracing::debug!(session_id = %shared.id(), "outbound drain timed out");
    }
}

async fn outbound_pump<W: TransportWriter>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    ctx: PumpContext,
) {
    let config = Arc::clone(&ctx.config);
    let mut state = ctx.shared.subscribe_state();
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;
            () = wait_closing(&mut state) => {
                outbound.close();
                drain_and_close(&mut writer, &mut outbound, config.write_timeout, &ctx.shared).await;
                break "session closing";
            }
            next = outbound.recv() => {
                let Some(encoded) = next else {
                    let _ = write_with_deadline(
                        &mut writer,
                        Message::Close(None),
                        config.write_timeout,
                        &ctx.shared,
                    )
                    .await;
                    break "outbound queue closed";
                };
                let Some(message) = to_message(encoded) else {
                    continue;
                };
                if let Err(reason) =
                    write_with_deadline(&mut writer, message, config.write_timeout, &ctx.shared).await
                {
                    break reason;
                }
            }
            _ = ping.tick() => {
                if let Err(reason) = write_with_deadline(
                    &mut writer,
                    Message::Ping(Bytes::new()),
                    config.ping_write_timeout,
                    &ctx.shared,
                )
                .await
                {
                    break reason;
                }
                tracing::trace!(session_id = %ctx.shared.id(), "keepalive ping sent");
            }
        }
    };

    ctx.finish("outbound", reason);
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::domain::SessionId;
    use crate::transport::memory;

    fn sid(s: &str) -> SessionId {
        let Ok(id) = SessionId::new(s) else {
            panic!("valid id");
        };
        id
    }

    #[test]
    fn to_message_skips_unknown_tags() {
        assert!(to_message(Bytes::from_static(&[9, 0xFF, b'x'])).is_none());
        assert!(to_message(Bytes::from_static(&[1])).is_none());
    }

    #[test]
    fn to_message_maps_kinds() {
        let Ok(text) = Frame::text("hi") else {
            panic!("valid text");
        };
        assert!(matches!(to_message(text.encode()), Some(Message::Text(t)) if t.as_str() == "hi"));
        let binary = Frame::binary(vec![7u8]);
        assert!(matches!(to_message(binary.encode()), Some(Message::Binary(b)) if b == vec![7u8]));
    }

    #[test]
    fn control_messages_are_not_frames() {
        assert!(to_frame(Message::Ping(Bytes::new())).is_none());
        assert!(to_frame(Message::Pong(Bytes::new())).is_none());
        assert!(to_frame(Message::Close(None)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_pump_sends_keepalive_pings() {
        let config = BrokerConfig {
            ping_interval: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (transport, mut peer) = memory::pair();
        let Ok(_session) = broker.upgrade(transport, sid("A")).await else {
            panic!("upgrade failed");
        };

        let received =
            tokio::time::timeout(Duration::from_secs(6), peer.from_session.recv()).await;
        assert!(matches!(received, Ok(Some(Message::Ping(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_trips_read_deadline() {
        let config = BrokerConfig {
            ping_interval: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (transport, _peer) = memory::pair();
        let Ok(session) = broker.upgrade(transport, sid("A")).await else {
            panic!("upgrade failed");
        };

        let received =
            tokio::time::timeout(Duration::from_secs(15), session.receive_message()).await;
        assert!(matches!(received, Ok(Err(BrokerError::Disconnected(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_session_alive() {
        let config = BrokerConfig {
            ping_interval: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (transport, peer) = memory::pair();
        let Ok(session) = broker.upgrade(transport, sid("A")).await else {
            panic!("upgrade failed");
        };

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            assert!(peer.to_session.send(Message::Pong(Bytes::new())).await.is_ok());
        }
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn full_inbound_queue_drops_after_idle_timeout() {
        let config = BrokerConfig {
            queue_capacity: 1,
            idle_timeout: Duration::from_millis(50),
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (transport, peer) = memory::pair();
        let Ok(session) = broker.upgrade(transport, sid("A")).await else {
            panic!("upgrade failed");
        };

        for text in ["kept", "dropped"] {
            assert!(peer.to_session.send(Message::text(text)).await.is_ok());
        }
        // "dropped" waits for room past the idle timeout and is discarded.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let Ok(first) = session.receive_message().await else {
            panic!("first message missing");
        };
        assert_eq!(first.as_text(), Some("kept"));

        assert!(peer.to_session.send(Message::text("later")).await.is_ok());
        let Ok(Ok(next)) =
            tokio::time::timeout(Duration::from_secs(2), session.receive_message()).await
        else {
            panic!("next message missing");
        };
        assert_eq!(next.as_text(), Some("later"));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn stalled_writer_ends_session_after_write_timeout() {
        let config = BrokerConfig {
            write_timeout: Duration::from_millis(50),
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config);
        let (transport, _peer) = memory::stalled_pair();
        let Ok(session) = broker.upgrade(transport, sid("A")).await else {
            panic!("upgrade failed");
        };
        assert!(session.send_message("stuck").is_ok());

        let Ok(()) = tokio::time::timeout(Duration::from_secs(2), session.closed()).await else {
            panic!("session never closed");
        };
        assert!(matches!(broker.member_count().await, Ok(0)));
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            self.0
                .lock()
                .map(|buf| String::from_utf8_lossy(&buf).into_owned())
                .unwrap_or_default()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut captured) = self.0.lock() {
                captured.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pump_logs_carry_the_current_id() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let broker = Broker::new(BrokerConfig::default());
        let (transport, peer) = memory::pair();
        let Ok(session) = broker.upgrade(transport, sid("CID-old")).await else {
            panic!("upgrade failed");
        };
        assert!(session.change_id("alice").await.is_ok());

        assert!(peer.to_session.send(Message::text("hi")).await.is_ok());
        let Ok(Ok(_)) = tokio::time::timeout(Duration::from_secs(2), session.receive_message()).await
        else {
            panic!("message missing");
        };
        drop(peer);
        let Ok(()) = tokio::time::timeout(Duration::from_secs(2), session.closed()).await else {
            panic!("session never closed");
        };

        let logs = capture.contents();
        let pump_lines: Vec<&str> = logs
            .lines()
            .filter(|line| line.contains("message received") || line.contains("pump stopped"))
            .collect();
        assert!(!pump_lines.is_empty(), "no pump logs captured:\n{logs}");
        assert!(
            pump_lines.iter().all(|line| line.contains("session_id=alice")),
            "stale id in pump logs:\n{logs}"
        );
    }
}
