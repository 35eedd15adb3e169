//! In-process transport
//!
//! Every `open` produces a [`RemoteEnd`] on the listener, which plays the
//! service side: it reads what the client sent and injects replies, closes
//! and errors. Embedders use it to host the service in the same process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::network::link::{Link, LinkEvent, MessageTransport, Outgoing};
use crate::protocol::Envelope;

/// Service side of one in-memory link
#[derive(Debug)]
pub struct RemoteEnd {
    pub from_client: mpsc::UnboundedReceiver<Outgoing>,
    pub to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl RemoteEnd {
    /// Next text frame from the client; None once the client closed
    pub async fn recv_text(&mut self) -> Option<String> {
        match self.from_client.recv().await? {
            Outgoing::Text(text) => Some(text),
            Outgoing::Close => None,
        }
    }

    /// Next frame parsed as an envelope, skipping malformed ones
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let text = self.recv_text().await?;
            if let Ok(envelope) = Envelope::parse(&text) {
                return Some(envelope);
            }
        }
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Message(text.into())).is_ok()
    }

    pub fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self.to_client.send(LinkEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn fail(&self, message: &str) {
        let _ = self.to_client.send(LinkEvent::Error(message.to_string()));
    }
}

pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<RemoteEnd>,
    refusals: Mutex<VecDeque<TransportError>>,
}

impl MemoryTransport {
    /// Transport plus the listener that receives each opened link
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accepted, listener) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refusals: Mutex::new(VecDeque::new()),
            },
            listener,
        )
    }

    /// Make the next `open` fail with `error`
    pub fn refuse_next(&self, error: TransportError) {
        self.refusals.lock().push_back(error);
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn open(&self) -> Result<Link, TransportError> {
        let refusal = self.refusals.lock().pop_front();
        if let Some(error) = refusal {
            return Err(error);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(RemoteEnd {
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| TransportError::ConnectionFailed("listener dropped".into()))?;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn endpoint(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_carries_both_directions() {
        let (transport, mut listener) = MemoryTransport::new();
        let mut link = transport.open().await.unwrap();
        let mut remote = listener.recv().await.unwrap();

        assert!(link.send_text("hello".into()));
        assert_eq!(remote.recv_text().await.as_deref(), Some("hello"));

        remote.send_text("world");
        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Message("world".into())));

        link.close();
        assert_eq!(remote.recv_text().await, None);
    }

    #[tokio::test]
    async fn test_refused_open() {
        let (transport, _listener) = MemoryTransport::new();
        transport.refuse_next(TransportError::ConnectionFailed("refused".into()));

        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_ok());
    }
}
