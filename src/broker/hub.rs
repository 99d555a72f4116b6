//! The broker: a registry of live sessions owned by one control loop.
//!
//! Every mutation of the member set and every fan-out runs inside a single
//! task that drains one bounded command queue, so the registry needs no
//! lock and no caller ever observes a half-updated member set. Commands are
//! processed strictly in submission order: a `SendTo` submitted after a
//! deregistration is always answered after that deregistration took effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::pump;
use super::session::{EnqueueError, Session, SessionShared};
use crate::config::BrokerConfig;
use crate::domain::{Frame, MessageKind, SessionId, SessionState};
use crate::error::BrokerError;
use crate::transport::Transport;

/// Request processed by the control loop.
#[derive(Debug)]
pub(crate) enum Command {
    Register {
        session: Arc<SessionShared>,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Unregister {
        session: Arc<SessionShared>,
    },
    Rename {
        session: Arc<SessionShared>,
        new_id: SessionId,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    SendTo {
        id: SessionId,
        frame: Bytes,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Broadcast {
        kind: MessageKind,
        frame: Bytes,
    },
    Members {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
}

/// Handle to a running broker.
///
/// Cheap to clone; all clones feed the same control loop. The loop stops
/// once every `Broker` handle is dropped, draining any remaining members.
/// Sessions only hold a weak reference back to the broker, so they do not
/// keep it alive.
#[derive(Debug, Clone)]
pub struct Broker {
    tx: mpsc::Sender<Command>,
    config: Arc<BrokerConfig>,
}

impl Broker {
    /// Creates a broker and spawns its control loop on the current tokio
    /// runtime.
    ///
    /// Capacities of zero are raised to one.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.control_capacity.max(1));
        tokio::spawn(run_control_loop(rx));
        tracing::debug!(
            control_capacity = config.control_capacity,
            queue_capacity = config.queue_capacity,
            "broker control loop started"
        );
        Self {
            tx,
            config: Arc::new(config),
        }
    }

    /// Returns the broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Takes over a freshly upgraded transport: creates the session,
    /// registers it under `default_id`, and starts its pumps.
    ///
    /// The session is visible to [`Broker::send_to`] and
    /// [`Broker::broadcast`] as soon as this returns. On failure the
    /// transport is dropped, which closes the connection.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::DuplicateId`] if `default_id` is already registered.
    /// - [`BrokerError::BrokerBusy`] if the control queue stayed full for the
    ///   write timeout.
    /// - [`BrokerError::BrokerUnavailable`] if the control loop has stopped.
    pub async fn upgrade<T: Transport>(
        &self,
        transport: T,
        default_id: SessionId,
    ) -> Result<Session, BrokerError> {
        let capacity = self.config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let shared = Arc::new(SessionShared::new(default_id, outbound_tx));
        let link = self.link();

        let pending = PendingRegistration {
            shared: &shared,
            link: &link,
            done: false,
        };
        self.register_session(&shared).await?;
        pending.finish();

        pump::spawn(
            transport,
            Arc::clone(&shared),
            inbound_tx,
            outbound_rx,
            link.clone(),
            Arc::clone(&self.config),
        );
        shared.advance(SessionState::Active);

        Ok(Session::new(shared, inbound_rx, link))
    }

    /// Registers a session with the control loop and waits until it is a
    /// member.
    ///
    /// # Errors
    ///
    /// See [`Broker::upgrade`].
    pub(crate) async fn register_session(
        &self,
        session: &Arc<SessionShared>,
    ) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Register {
            session: Arc::clone(session),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::BrokerUnavailable)?
    }

    /// Requests deregistration of `session`.
    ///
    /// Idempotent: deregistering a session that is no longer a member is a
    /// no-op. The first effective deregistration closes both of the
    /// session's queues.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::BrokerBusy`] if the control queue stayed full for the
    ///   write timeout.
    /// - [`BrokerError::BrokerUnavailable`] if the control loop has stopped.
    pub async fn unregister_session(&self, session: &Session) -> Result<(), BrokerError> {
        self.submit(Command::Unregister {
            session: Arc::clone(session.shared()),
        })
        .await
    }

    /// Delivers one message to the member registered under `id`.
    ///
    /// Never retries. A recipient whose outbound queue is full is evicted.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::InvalidTextEncoding`] for a text payload that is not
    ///   valid UTF-8.
    /// - [`BrokerError::SessionNotFound`] if no live member has that id when
    ///   the request is processed.
    /// - [`BrokerError::ConnectionClosing`] if the recipient's queue was full
    ///   and the recipient has been evicted.
    /// - [`BrokerError::BrokerBusy`] / [`BrokerError::BrokerUnavailable`] as
    ///   for [`Broker::unregister_session`].
    pub async fn send_to(
        &self,
        id: &SessionId,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), BrokerError> {
        let frame = Frame::new(kind, payload)?.encode();
        let (reply, rx) = oneshot::channel();
        self.submit(Command::SendTo {
            id: id.clone(),
            frame,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::BrokerUnavailable)?
    }

    /// Queues a message for delivery to every current member.
    ///
    /// Returns once the control loop has accepted the request. Delivery is
    /// best-effort: a failure for one member is logged and does not affect
    /// the others.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::InvalidTextEncoding`] for a text payload that is not
    ///   valid UTF-8.
    /// - [`BrokerError::BrokerBusy`] if the control queue stayed full for the
    ///   write timeout.
    /// - [`BrokerError::BrokerUnavailable`] if the control loop has stopped.
    pub async fn broadcast(
        &self,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), BrokerError> {
        let frame = Frame::new(kind, payload)?.encode();
        self.submit(Command::Broadcast { kind, frame }).await
    }

    /// Broadcasts a text message. See [`Broker::broadcast`].
    ///
    /// # Errors
    ///
    /// See [`Broker::broadcast`].
    pub async fn broadcast_text(&self, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        self.broadcast(MessageKind::Text, payload).await
    }

    /// Broadcasts a binary message. See [`Broker::broadcast`].
    ///
    /// # Errors
    ///
    /// See [`Broker::broadcast`].
    pub async fn broadcast_binary(&self, payload: impl Into<Bytes>) -> Result<(), BrokerError> {
        self.broadcast(MessageKind::Binary, payload).await
    }

    /// Returns the ids of all current members, sorted.
    ///
    /// # Errors
    ///
    /// [`BrokerError::BrokerBusy`] / [`BrokerError::BrokerUnavailable`] as
    /// for [`Broker::unregister_session`].
    pub async fn members(&self) -> Result<Vec<SessionId>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Members { reply }).await?;
        rx.await.map_err(|_| BrokerError::BrokerUnavailable)
    }

    /// Returns the number of current members.
    ///
    /// # Errors
    ///
    /// See [`Broker::members`].
    pub async fn member_count(&self) -> Result<usize, BrokerError> {
        Ok(self.members().await?.len())
    }

    async fn submit(&self, command: Command) -> Result<(), BrokerError> {
        submit(&self.tx, command, self.config.write_timeout).await
    }

    fn link(&self) -> ControlLink {
        ControlLink {
            tx: self.tx.downgrade(),
            wait: self.config.write_timeout,
        }
    }
}

/// Enqueues a command: immediately if there is room, otherwise waiting up
/// to `wait` for the control loop to catch up.
async fn submit(
    tx: &mpsc::Sender<Command>,
    command: Command,
    wait: Duration,
) -> Result<(), BrokerError> {
    match tx.try_send(command) {
        Ok(()) => Ok(()),
        Err(TrySendError::Closed(_)) => Err(BrokerError::BrokerUnavailable),
        Err(TrySendError::Full(command)) => match tokio::time::timeout(wait, tx.send(command)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::BrokerUnavailable),
            Err(_) => Err(BrokerError::BrokerBusy),
        },
    }
}

/// Abandons a registration that did not finish: on error, or when the
/// `upgrade` future is dropped while waiting for the control loop.
///
/// A `Register` that is still queued finds the session closing and is
/// refused. One that was already applied is undone by the `Unregister`
/// queued behind it.
struct PendingRegistration<'a> {
    shared: &'a Arc<SessionShared>,
    link: &'a ControlLink,
    done: bool,
}

impl PendingRegistration<'_> {
    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.shared.begin_draining();
        self.shared.advance(SessionState::Closed);
        self.link.request_unregister(self.shared);
    }
}

/// A session's weak back-reference to its broker.
#[derive(Debug, Clone)]
pub(crate) struct ControlLink {
    tx: mpsc::WeakSender<Command>,
    wait: Duration,
}

impl ControlLink {
    /// Submits a command with the broker's enqueue policy.
    pub(crate) async fn submit(&self, command: Command) -> Result<(), BrokerError> {
        let tx = self.tx.upgrade().ok_or(BrokerError::BrokerUnavailable)?;
        submit(&tx, command, self.wait).await
    }

    /// Asks the control loop to deregister `session` without waiting.
    ///
    /// Used from synchronous paths (eviction) and from exiting pumps. If
    /// the control queue is full the request is retried from a background
    /// task; if the broker is gone there is nothing to deregister from.
    pub(crate) fn request_unregister(&self, session: &Arc<SessionShared>) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let command = Command::Unregister {
            session: Arc::clone(session),
        };
        match tx.try_send(command) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = tx.send(command).await;
                    });
                } else {
                    tracing::debug!(
                        session_id = %session.id(),
                        "control queue full and no runtime, deferring deregistration to pumps"
                    );
                }
            }
        }
    }
}

/// Member set owned by the control loop.
#[derive(Debug, Default)]
struct Registry {
    members: HashMap<SessionId, Arc<SessionShared>>,
}

impl Registry {
    fn is_member(&self, id: &SessionId, session: &Arc<SessionShared>) -> bool {
        self.members
            .get(id)
            .is_some_and(|member| Arc::ptr_eq(member, session))
    }

    fn register(&mut self, session: Arc<SessionShared>) -> Result<(), BrokerError> {
        let id = session.id();
        if session.state().is_closing() {
            return Err(BrokerError::Disconnected(id));
        }
        if self.members.contains_key(&id) {
            return Err(BrokerError::DuplicateId(id));
        }
        self.members.insert(id.clone(), session);
        tracing::info!(session_id = %id, members = self.members.len(), "session registered");
        Ok(())
    }

    fn unregister(&mut self, session: &Arc<SessionShared>) {
        let id = session.id();
        if !self.is_member(&id, session) {
            tracing::debug!(session_id = %id, "session not registered or already removed");
            return;
        }
        self.remove(&id);
    }

    /// Removes the member under `id` and closes its queues.
    fn remove(&mut self, id: &SessionId) {
        if let Some(session) = self.members.remove(id) {
            session.begin_draining();
            tracing::info!(session_id = %id, members = self.members.len(), "session unregistered");
        }
    }

    fn rename(
        &mut self,
        session: &Arc<SessionShared>,
        new_id: SessionId,
    ) -> Result<(), BrokerError> {
        let old_id = session.id();
        if !self.is_member(&old_id, session) || session.state().is_closing() {
            return Err(BrokerError::Disconnected(old_id));
        }
        if old_id == new_id {
            return Ok(());
        }
        if self.members.contains_key(&new_id) {
            return Err(BrokerError::DuplicateId(new_id));
        }
        if let Some(member) = self.members.remove(&old_id) {
            member.set_id(new_id.clone());
            self.members.insert(new_id.clone(), member);
        }
        tracing::debug!(old_id = %old_id, new_id = %new_id, "session id changed");
        Ok(())
    }

    fn send_to(&mut self, id: &SessionId, frame: Bytes) -> Result<(), BrokerError> {
        let Some(session) = self.members.get(id) else {
            return Err(BrokerError::SessionNotFound(id.clone()));
        };
        if session.state().is_closing() {
            return Err(BrokerError::SessionNotFound(id.clone()));
        }
        match session.try_enqueue(frame) {
            Ok(()) => Ok(()),
            Err(EnqueueError::Full) => {
                tracing::warn!(session_id = %id, "outbound queue full, evicting session");
                self.remove(id);
                Err(BrokerError::ConnectionClosing(id.clone()))
            }
            Err(EnqueueError::Closed) => {
                self.remove(id);
                Err(BrokerError::SessionNotFound(id.clone()))
            }
        }
    }

    fn broadcast(&mut self, kind: MessageKind, frame: &Bytes) {
        let mut evicted = Vec::new();
        for (id, session) in &self.members {
            if session.state().is_closing() {
                continue;
            }
            if let Err(err) = session.try_enqueue(frame.clone()) {
                tracing::warn!(
                    session_id = %id,
                    %kind,
                    error = %err,
                    "broadcast delivery failed"
                );
                evicted.push(id.clone());
            }
        }
        for id in &evicted {
            self.remove(id);
        }
    }

    fn member_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn drain(&mut self) {
        for (_, session) in self.members.drain() {
            session.begin_draining();
        }
    }
}

async fn run_control_loop(mut rx: mpsc::Receiver<Command>) {
    let mut registry = Registry::default();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Register { session, reply } => {
                let registered = registry.register(Arc::clone(&session));
                if reply.send(registered).is_err() {
                    tracing::debug!(session_id = %session.id(), "registration abandoned by caller");
                    registry.unregister(&session);
                }
            }
            Command::Unregister { session } => registry.unregister(&session),
            Command::Rename {
                session,
                new_id,
                reply,
            } => {
                let _ = reply.send(registry.rename(&session, new_id));
            }
            Command::SendTo { id, frame, reply } => {
                let _ = reply.send(registry.send_to(&id, frame));
            }
            Command::Broadcast { kind, frame } => registry.broadcast(kind, &frame),
            Command::Members { reply } => {
                let _ = reply.send(registry.member_ids());
            }
        }
    }

    registry.drain();
    tracing::debug!("broker control loop stopped");
}
