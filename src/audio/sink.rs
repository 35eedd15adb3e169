//! Audio output seam
//!
//! An [`AudioSink`] owns an audio clock and renders scheduled sources. The
//! playback scheduler only talks to this trait, so the scheduling math runs
//! the same against a sound card and against a virtual clock.

use async_trait::async_trait;
use std::sync::Arc;

use crate::audio::buffer::{PcmBuffer, SharedRingBuffer};
use crate::error::AudioError;

/// Identifier of one scheduled source, unique per scheduler
pub type SourceId = u64;

/// Analysis tap on the output graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tap {
    /// Feeds the audible output
    Speaker,
    /// Analysis only, never reaches the speaker
    Visualizer,
}

/// Which taps a source is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routing {
    pub speaker: bool,
    pub visualizer: bool,
}

impl Routing {
    /// Visualizer always, speaker only when unmuted
    pub fn for_mute_state(muted: bool) -> Self {
        Self {
            speaker: !muted,
            visualizer: true,
        }
    }

    pub fn includes(&self, tap: Tap) -> bool {
        match tap {
            Tap::Speaker => self.speaker,
            Tap::Visualizer => self.visualizer,
        }
    }
}

/// Engine run state, modelled on a browser audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    /// Clock stopped until `resume` succeeds (autoplay policies, paused device)
    Suspended,
    Closed,
}

/// A decoded buffer bound to a start time on the sink clock
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub buffer: Arc<PcmBuffer>,
    /// Start time in seconds on the sink clock
    pub start: f64,
    pub routing: Routing,
}

impl ScheduledSource {
    pub fn end(&self) -> f64 {
        self.start + self.buffer.duration()
    }
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Rate every scheduled buffer must be rendered at
    fn sample_rate(&self) -> u32;

    /// Current position of the audio clock in seconds
    fn current_time(&self) -> f64;

    fn state(&self) -> EngineState;

    async fn resume(&self) -> Result<(), AudioError>;

    fn start_source(&self, source: ScheduledSource);

    /// Stop a source immediately; unknown or finished ids are ignored
    fn stop_source(&self, id: SourceId);

    /// Byte spectrum of what the tap is currently rendering
    fn frequency_data(&self, tap: Tap, out: &mut [u8]);

    /// Release the output graph; the sink is unusable afterwards
    fn close(&self);

    /// Mono blocks of what reached the speaker, at [`AudioSink::sample_rate`]
    fn echo_reference(&self) -> Option<SharedRingBuffer> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_for_mute_state() {
        let muted = Routing::for_mute_state(true);
        assert!(!muted.includes(Tap::Speaker));
        assert!(muted.includes(Tap::Visualizer));

        let audible = Routing::for_mute_state(false);
        assert!(audible.includes(Tap::Speaker));
        assert!(audible.includes(Tap::Visualizer));
    }
}
