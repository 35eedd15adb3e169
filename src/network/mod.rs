//! Network subsystem: message links and the session transport

pub mod dispatch;
pub mod link;
pub mod memory;
pub mod reconnect;
pub mod session;
pub mod websocket;

pub use dispatch::{Dispatcher, HandlerId, Subscription};
pub use link::{Link, LinkEvent, MessageTransport, Outgoing};
pub use memory::{MemoryTransport, RemoteEnd};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use session::{ConnectionState, Session, SessionTransport};
pub use websocket::WsTransport;
