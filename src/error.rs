//! Error types for the voice streaming core

use std::time::Duration;

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session transport errors
///
/// Only the initial handshake surfaces these to the caller. Drops after a
/// successful handshake are retried inside the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed before handshake: {code:?} {reason}")]
    ClosedBeforeHandshake { code: Option<u16>, reason: String },

    #[error("No init reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Envelope could not be serialized: {0}")]
    Encode(String),
}

/// Microphone capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Transport is not open")]
    NotConnected,

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Microphone unavailable: {0}")]
    Unavailable(String),

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),
}

impl CaptureError {
    /// Message suitable for showing to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::NotConnected => "cannot reach server",
            _ => "microphone unavailable",
        }
    }
}

/// Audio output subsystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio engine resume failed: {0}")]
    ResumeFailed(String),

    #[error("Audio engine is closed")]
    Closed,

    #[error("Resampler error: {0}")]
    Resample(String),

    #[error("Voice processing error: {0}")]
    Processing(String),
}

/// Audio payload decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("Missing audio payload")]
    MissingPayload,

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
}

/// Envelope parsing errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope has no message kind")]
    MissingKind,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
