//! Message-socket seam
//!
//! A [`MessageTransport`] opens one text-message link to the service. The
//! session layer above it only sees channel endpoints, so the same
//! handshake and reconnect logic runs over a WebSocket or in memory.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Frame queued for the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// Event produced by the socket reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Both directions of one open socket
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    /// Queue a text frame; false once the writer side is gone
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Outgoing::Text(text)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outgoing::Close);
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Open a fresh link; each reconnect attempt calls this again
    async fn open(&self) -> Result<Link, TransportError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}
