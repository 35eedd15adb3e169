//! Session transport: handshake, resume and bounded reconnect
//!
//! ```text
//! Idle ─connect()─▶ Connecting ─init─▶ Open ─disconnect()─▶ Closing ─▶ Idle
//!                                       │
//!                                     drop
//!                                       ▼
//!                 Connecting ◀─delay─ Reconnecting ◀─ Dropped
//!                                       │
//!                                  cap reached ─▶ Idle
//! ```
//!
//! The first handshake reports its failure to the caller. Once a session is
//! open, drops are retried in the background with the last known session id
//! and slot, and surface only as state changes.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{ReconnectConfig, ServerConfig};
use crate::error::TransportError;
use crate::network::dispatch::{Dispatcher, HandlerId, Subscription};
use crate::network::link::{LinkEvent, MessageTransport, Outgoing};
use crate::network::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::protocol::{Channel, Envelope, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Dropped,
    Reconnecting,
}

/// Identity kept across reconnects
#[derive(Debug, Clone)]
pub struct Session {
    /// Assigned by the service in its `init` reply
    pub id: Option<String>,
    /// Which logical connection of a multi-socket session this is
    pub slot: Option<i64>,
    pub policy: ReconnectPolicy,
}

struct Established {
    id: String,
    writer: mpsc::UnboundedSender<Outgoing>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

struct Inner {
    session: Session,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct SessionTransport {
    transport: Arc<dyn MessageTransport>,
    dispatcher: Dispatcher,
    inner: Mutex<Inner>,
    /// Bumped by connect/disconnect so stale attempts and supervisors stand
    /// down; only changed with `inner` held
    epoch: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    handshake_timeout: Duration,
}

impl SessionTransport {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        server: &ServerConfig,
        reconnect: &ReconnectConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            transport,
            dispatcher: Dispatcher::new(),
            inner: Mutex::new(Inner {
                session: Session {
                    id: server.session_id.clone(),
                    slot: server.slot,
                    policy: ReconnectPolicy::new(
                        reconnect.max_attempts,
                        Duration::from_millis(reconnect.delay_ms),
                    ),
                },
                writer: None,
                supervisor: None,
            }),
            epoch: watch::channel(0).0,
            state,
            handshake_timeout: Duration::from_secs(reconnect.handshake_timeout_secs),
        })
    }

    /// Open the socket and complete the handshake
    ///
    /// Resolves with the session id from the `init` reply. A failure here
    /// is never retried.
    pub async fn connect(self: &Arc<Self>) -> Result<String, TransportError> {
        if self.is_connected() {
            if let Some(id) = self.session_id() {
                return Ok(id);
            }
        }

        let epoch = {
            let mut inner = self.inner.lock();
            if let Some(supervisor) = inner.supervisor.take() {
                supervisor.abort();
            }
            inner.session.policy.rearm();
            self.next_epoch()
        };

        self.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", self.transport.endpoint());

        match self.establish(epoch).await {
            Ok(established) => {
                let id = established.id.clone();
                let mut inner = self.inner.lock();
                if self.current_epoch() != epoch {
                    let _ = established.writer.send(Outgoing::Close);
                    return Err(TransportError::ConnectionFailed("connect superseded".into()));
                }
                inner.writer = Some(established.writer);
                let supervisor = self.clone();
                inner.supervisor = Some(tokio::spawn(async move {
                    supervisor.supervise(epoch, established.inbound).await
                }));
                drop(inner);

                self.set_state(ConnectionState::Open);
                tracing::info!("Session {} open", id);
                Ok(id)
            }
            Err(e) => {
                tracing::error!("Connection to {} failed: {}", self.transport.endpoint(), e);
                if self.current_epoch() == epoch {
                    self.set_state(ConnectionState::Idle);
                }
                Err(e)
            }
        }
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Call with `inner` held
    fn next_epoch(&self) -> u64 {
        self.epoch.send_modify(|epoch| *epoch += 1);
        self.current_epoch()
    }

    /// One attempt for `epoch`: open, `connect`, `init`, all under the watchdog
    ///
    /// The attempt is abandoned as soon as `epoch` is superseded. Dropping it
    /// drops the half-open link, which closes it.
    async fn establish(&self, epoch: u64) -> Result<Established, TransportError> {
        let mut epochs = self.epoch.subscribe();
        let attempt = tokio::time::timeout(self.handshake_timeout, self.handshake());

        let (init, writer, inbound) = tokio::select! {
            result = attempt => match result {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::HandshakeTimeout(self.handshake_timeout)),
            },
            _ = epochs.wait_for(|current| *current != epoch) => {
                return Err(TransportError::ConnectionFailed("connect superseded".into()));
            }
        };

        let id = {
            let mut inner = self.inner.lock();
            if self.current_epoch() != epoch {
                drop(inner);
                let _ = writer.send(Outgoing::Close);
                return Err(TransportError::ConnectionFailed("connect superseded".into()));
            }
            let session = &mut inner.session;
            if let Some(id) = &init.session_id {
                session.id = Some(id.clone());
            }
            if init.slot.is_some() {
                session.slot = init.slot;
            }
            session.policy.reset();
            session.id.clone()
        };
        let id = match id {
            Some(id) => id,
            None => {
                let _ = writer.send(Outgoing::Close);
                return Err(TransportError::ConnectionFailed("init reply carried no session id".into()));
            }
        };

        self.dispatcher.dispatch(&init);
        Ok(Established { id, writer, inbound })
    }

    /// Open a link, send `connect` and wait for the `init` reply
    async fn handshake(
        &self,
    ) -> Result<(Envelope, mpsc::UnboundedSender<Outgoing>, mpsc::UnboundedReceiver<LinkEvent>), TransportError>
    {
        let link = self.transport.open().await?;
        let (known_id, slot) = {
            let inner = self.inner.lock();
            (inner.session.id.clone(), inner.session.slot)
        };

        let hello = Envelope::connect(known_id.clone(), slot)
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        if !link.send_text(hello) {
            return Err(TransportError::ConnectionFailed("link closed before connect".into()));
        }

        let writer = link.outbound;
        let mut inbound = link.inbound;

        let reply = async {
            loop {
                match inbound.recv().await {
                    Some(LinkEvent::Message(text)) => match Envelope::parse(&text) {
                        Ok(envelope) if envelope.kind == MessageKind::Init => return Ok(envelope),
                        Ok(envelope) => {
                            tracing::debug!("Ignoring {} before init", envelope.kind);
                        }
                        Err(e) => tracing::warn!("Dropping malformed envelope: {}", e),
                    },
                    Some(LinkEvent::Closed { code, reason }) => {
                        return Err(TransportError::ClosedBeforeHandshake { code, reason })
                    }
                    Some(LinkEvent::Error(message)) => {
                        return Err(TransportError::ConnectionFailed(message))
                    }
                    None => {
                        return Err(TransportError::ClosedBeforeHandshake {
                            code: None,
                            reason: "link dropped".into(),
                        })
                    }
                }
            }
        };

        match reply.await {
            Ok(init) => Ok((init, writer, inbound)),
            Err(e) => {
                let _ = writer.send(Outgoing::Close);
                Err(e)
            }
        }
    }

    /// Pump inbound envelopes; on a drop, run the reconnect policy
    async fn supervise(self: Arc<Self>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            let (code, reason) = loop {
                match inbound.recv().await {
                    Some(LinkEvent::Message(text)) => self.handle_text(&text),
                    Some(LinkEvent::Closed { code, reason }) => break (code, reason),
                    Some(LinkEvent::Error(message)) => break (None, message),
                    None => break (None, "link dropped".to_string()),
                }
            };

            let mut decision = {
                let mut inner = self.inner.lock();
                if self.current_epoch() != epoch {
                    return;
                }
                inner.writer = None;
                inner.session.policy.on_drop()
            };
            if decision != ReconnectDecision::Suppressed {
                self.set_state(ConnectionState::Dropped);
                tracing::warn!("Connection dropped ({:?}: {})", code, reason);
            }

            inbound = loop {
                match decision {
                    ReconnectDecision::Retry { attempt, delay } => {
                        self.set_state(ConnectionState::Reconnecting);
                        tracing::info!("Reconnect attempt {} in {:?}", attempt, delay);
                        tokio::time::sleep(delay).await;

                        if self.current_epoch() != epoch {
                            return;
                        }
                        self.set_state(ConnectionState::Connecting);
                        match self.establish(epoch).await {
                            Ok(established) => {
                                let mut inner = self.inner.lock();
                                if self.current_epoch() != epoch {
                                    let _ = established.writer.send(Outgoing::Close);
                                    return;
                                }
                                inner.writer = Some(established.writer);
                                drop(inner);
                                self.set_state(ConnectionState::Open);
                                tracing::info!("Session {} resumed", established.id);
                                break established.inbound;
                            }
                            Err(e) => {
                                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                                let mut inner = self.inner.lock();
                                if self.current_epoch() != epoch {
                                    return;
                                }
                                decision = inner.session.policy.on_drop();
                            }
                        }
                    }
                    ReconnectDecision::Exhausted => {
                        tracing::error!("Giving up after repeated reconnect failures");
                        self.set_state(ConnectionState::Idle);
                        return;
                    }
                    ReconnectDecision::Suppressed => {
                        self.set_state(ConnectionState::Idle);
                        return;
                    }
                }
            };
        }
    }

    fn handle_text(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => {
                tracing::trace!("Inbound {}", envelope.kind);
                self.dispatcher.dispatch(&envelope);
            }
            Err(e) => tracing::warn!("Dropping malformed envelope: {}", e),
        }
    }

    /// Serialize and transmit; false when the socket is not open
    pub fn send(&self, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            tracing::error!("Cannot send {}: transport not open", envelope.kind);
            return false;
        }
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Cannot serialize {}: {}", envelope.kind, e);
                return false;
            }
        };
        let sent = match &self.inner.lock().writer {
            Some(writer) => writer.send(Outgoing::Text(text)).is_ok(),
            None => false,
        };
        if !sent {
            tracing::error!("Cannot send {}: socket writer gone", envelope.kind);
        }
        sent
    }

    /// Close on purpose; no reconnect follows
    pub fn disconnect(&self) {
        let (writer, supervisor) = {
            let mut inner = self.inner.lock();
            inner.session.policy.mark_intentional();
            inner.session.id = None;
            self.next_epoch();
            (inner.writer.take(), inner.supervisor.take())
        };

        self.set_state(ConnectionState::Closing);
        if let Some(writer) = writer {
            let _ = writer.send(Outgoing::Close);
        }
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        self.set_state(ConnectionState::Idle);
        tracing::info!("Disconnected from {}", self.transport.endpoint());
    }

    pub fn on<F>(&self, subscription: Subscription, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.dispatcher.on(subscription, Arc::new(handler))
    }

    pub fn off(&self, subscription: &Subscription, id: Option<HandlerId>) {
        self.dispatcher.off(subscription, id);
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().session.id.clone()
    }

    pub fn slot(&self) -> Option<i64> {
        self.inner.lock().session.slot
    }

    /// Session snapshot, including the reconnect counter
    pub fn session(&self) -> Session {
        self.inner.lock().session.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn send_ping(&self) -> bool {
        self.send(&Envelope::ping(chrono::Utc::now().timestamp_millis()))
    }

    pub fn send_input_text(&self, text: &str, output_channel: Channel) -> bool {
        self.send(&Envelope::input_text(self.session_id(), text, output_channel))
    }

    pub fn update_operations(&self, buttons: Value) -> bool {
        self.send(&Envelope::operations(self.session_id(), buttons))
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!("Connection state: {:?}", next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryTransport;

    fn session(transport: MemoryTransport) -> Arc<SessionTransport> {
        SessionTransport::new(
            Arc::new(transport),
            &ServerConfig::default(),
            &ReconnectConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_send_requires_open_socket() {
        let (transport, _listener) = MemoryTransport::new();
        let session = session(transport);

        assert!(!session.send(&Envelope::ping(0)));
        assert!(!session.send_ping());
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_sends_known_session() {
        let (transport, mut listener) = MemoryTransport::new();
        let server = ServerConfig {
            session_id: Some("abc".into()),
            slot: Some(2),
            ..ServerConfig::default()
        };
        let session = SessionTransport::new(Arc::new(transport), &server, &ReconnectConfig::default());

        let remote = tokio::spawn(async move {
            let mut end = listener.recv().await.unwrap();
            let hello = end.recv_envelope().await.unwrap();
            end.send_envelope(&Envelope::new(MessageKind::Init).with_session(Some("abc".into())));
            (hello, end)
        });

        assert_eq!(session.connect().await.unwrap(), "abc");
        let (hello, _end) = remote.await.unwrap();
        assert_eq!(hello.kind, MessageKind::Connect);
        assert_eq!(hello.session_id.as_deref(), Some("abc"));
        assert_eq!(hello.slot, Some(2));
        assert!(session.is_connected());
    }
}
