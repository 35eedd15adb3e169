//! # Voice Duplex
//!
//! Real-time duplex audio streaming core for a voice-assistant client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               VoiceClient                                 │
//! │                                                                          │
//! │  ┌────────────┐   input_audio (ch -1)    ┌──────────────────────────┐    │
//! │  │ Microphone │──▶ CaptureEngine ───────▶│     SessionTransport     │    │
//! │  └────────────┘   │ f32 → i16 → base64   │  connect / init / resume │    │
//! │                   │ first frame: ──┐     │  bounded reconnect       │◀──▶ remote
//! │                   ▼                │     │  dispatch by kind+channel│    │
//! │             capture analyser       │     └────────────┬─────────────┘    │
//! │                   │                ▼                  │ output_audio     │
//! │                   │     CancellationCoordinator       ▼                  │
//! │                   │       │ stop + cancel_audio  PlaybackScheduler       │
//! │                   │       └──────────────────▶  OutputQueue → decode     │
//! │                   │                             → next_play_time clock   │
//! │                   │                                   │                  │
//! │                   │                        ┌──────────┴──────────┐       │
//! │                   │                        ▼                     ▼       │
//! │                   │                  SpeakerTap            VisualizerTap │
//! │                   │                  (unmuted only)        (always)      │
//! │                   │                        │                     │       │
//! │                   │                   AudioSink ──▶ speaker      │       │
//! │                   ▼                        ▼                     ▼       │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │ MeterBridge: input bars ◀ capture    output bars ◀ speaker|visual │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Browser-style primitives sit behind three seams so the scheduling,
//! queueing and cancellation logic runs without a device or a socket:
//! [`network::MessageTransport`], [`audio::AudioSink`] and
//! [`audio::capture::Microphone`].

pub mod audio;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use client::{ClientEvent, VoiceClient};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Capture sample rate for the default provider profile
    pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16_000;

    /// Output sample rate shared by every provider profile
    pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

    /// Capture channel count (mono)
    pub const CAPTURE_CHANNELS: u16 = 1;

    /// Samples per outbound capture frame
    pub const CAPTURE_FRAME_SAMPLES: usize = 1024;

    /// Sub-channel used for microphone input and cancellation notices
    pub const CAPTURE_CHANNEL: i64 = -1;

    /// Scheduling lookahead in milliseconds
    pub const DEFAULT_LOOKAHEAD_MS: u64 = 50;

    /// Handshake watchdog in seconds
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

    /// Reconnect attempts after an unexpected drop
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Fixed delay between reconnect attempts in milliseconds
    pub const RECONNECT_DELAY_MS: u64 = 3_000;

    /// Bars per meter direction
    pub const METER_BAR_COUNT: usize = 64;

    /// Meter refresh interval in milliseconds
    pub const METER_INTERVAL_MS: u64 = 16;

    /// Analyser FFT size for the microphone signal
    pub const CAPTURE_FFT_SIZE: usize = 128;

    /// Analyser FFT size for the playback taps
    pub const OUTPUT_FFT_SIZE: usize = 256;

    /// Lock-free ring buffer capacity (in device callbacks)
    pub const RING_BUFFER_CAPACITY: usize = 256;

    /// Default content tag for raw fixed-point audio
    pub const PCM_MIME: &str = "audio/pcm";
}
