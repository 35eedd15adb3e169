//! Audio subsystem module

pub mod analyser;
pub mod buffer;
pub mod capture;
#[cfg(feature = "device")]
pub mod device;
pub mod meter;
pub mod mixer;
#[cfg(feature = "device")]
pub mod output;
pub mod playback;
pub mod processing;
pub mod resample;
pub mod sink;
pub mod virtual_sink;

pub use buffer::{AudioChunk, PcmBuffer, RingBuffer};
pub use capture::{CaptureEngine, CaptureRequest, Microphone, MicrophoneStream};
#[cfg(feature = "device")]
pub use capture::CpalMicrophone;
#[cfg(feature = "device")]
pub use device::{list_devices, DeviceInfo};
pub use meter::{LevelSource, MeterBridge, MeterSnapshot};
#[cfg(feature = "device")]
pub use output::CpalSink;
pub use playback::{PlaybackClock, PlaybackScheduler};
pub use processing::{ProcessingSettings, VoiceProcessor};
pub use resample::StreamResampler;
pub use sink::{AudioSink, EngineState, Routing, ScheduledSource, SourceId, Tap};
pub use virtual_sink::VirtualSink;
