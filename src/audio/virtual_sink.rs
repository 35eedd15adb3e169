//! Device-free audio sink
//!
//! Renders into a [`Mixer`] against a software clock. Used for headless runs
//! and throughout the test suite. The realtime clock follows
//! `tokio::time::Instant`, so paused-time tests drive it with `sleep`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::mixer::Mixer;
use crate::audio::sink::{AudioSink, EngineState, Routing, ScheduledSource, SourceId, Tap};
use crate::constants::OUTPUT_FFT_SIZE;
use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockMode {
    Manual,
    Realtime,
}

struct Clock {
    mode: ClockMode,
    /// Seconds accumulated up to `anchor`
    base: f64,
    /// Set while the realtime clock is running
    anchor: Option<Instant>,
}

impl Clock {
    fn now(&self) -> f64 {
        match (self.mode, self.anchor) {
            (ClockMode::Realtime, Some(anchor)) => self.base + anchor.elapsed().as_secs_f64(),
            _ => self.base,
        }
    }

    fn freeze(&mut self) {
        self.base = self.now();
        self.anchor = None;
    }

    fn run(&mut self) {
        if self.mode == ClockMode::Realtime && self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }
}

/// Record of a `start_source` call
#[derive(Debug, Clone, PartialEq)]
pub struct StartedSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
    pub routing: Routing,
}

impl StartedSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

struct VirtualState {
    clock: Clock,
    engine: EngineState,
    mixer: Mixer,
    speaker: SpectrumAnalyser,
    visualizer: SpectrumAnalyser,
    fail_resume: bool,
    resume_calls: usize,
    started: Vec<StartedSource>,
    stopped: Vec<SourceId>,
}

pub struct VirtualSink {
    sample_rate: u32,
    state: Mutex<VirtualState>,
}

impl VirtualSink {
    /// Clock only moves through [`advance`](Self::advance)
    pub fn manual(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self::with_clock(sample_rate, ClockMode::Manual))
    }

    /// Clock follows tokio time
    pub fn realtime(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self::with_clock(sample_rate, ClockMode::Realtime))
    }

    fn with_clock(sample_rate: u32, mode: ClockMode) -> Self {
        let mut clock = Clock {
            mode,
            base: 0.0,
            anchor: None,
        };
        clock.run();
        Self {
            sample_rate,
            state: Mutex::new(VirtualState {
                clock,
                engine: EngineState::Running,
                mixer: Mixer::new(sample_rate),
                speaker: SpectrumAnalyser::new(OUTPUT_FFT_SIZE),
                visualizer: SpectrumAnalyser::new(OUTPUT_FFT_SIZE),
                fail_resume: false,
                resume_calls: 0,
                started: Vec::new(),
                stopped: Vec::new(),
            }),
        }
    }

    /// Move a manual clock forward; no effect while suspended
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        if state.engine == EngineState::Running && state.clock.mode == ClockMode::Manual {
            state.clock.base += by.as_secs_f64();
        }
    }

    /// Simulate the platform suspending or resuming the engine
    pub fn set_suspended(&self, suspended: bool) {
        let mut state = self.state.lock();
        if state.engine == EngineState::Closed {
            return;
        }
        if suspended {
            state.clock.freeze();
            state.engine = EngineState::Suspended;
        } else {
            state.clock.run();
            state.engine = EngineState::Running;
        }
    }

    /// Make subsequent `resume` calls fail
    pub fn fail_resume(&self, fail: bool) {
        self.state.lock().fail_resume = fail;
    }

    pub fn resume_calls(&self) -> usize {
        self.state.lock().resume_calls
    }

    pub fn started(&self) -> Vec<StartedSource> {
        self.state.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.state.lock().stopped.clone()
    }

    /// Sources still rendering at the current clock position
    pub fn active_ids(&self) -> Vec<SourceId> {
        let state = self.state.lock();
        let frame = state.mixer.frame_at(state.clock.now());
        state.mixer.active_ids(frame)
    }
}

#[async_trait]
impl AudioSink for VirtualSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.state.lock().clock.now()
    }

    fn state(&self) -> EngineState {
        self.state.lock().engine
    }

    async fn resume(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        state.resume_calls += 1;
        match state.engine {
            EngineState::Closed => Err(AudioError::Closed),
            _ if state.fail_resume => Err(AudioError::ResumeFailed("resume rejected".into())),
            _ => {
                state.clock.run();
                state.engine = EngineState::Running;
                Ok(())
            }
        }
    }

    fn start_source(&self, source: ScheduledSource) {
        let mut state = self.state.lock();
        if state.engine == EngineState::Closed {
            return;
        }
        let now = state.mixer.frame_at(state.clock.now());
        state.mixer.prune(now);
        state.mixer.add(&source);
        state.started.push(StartedSource {
            id: source.id,
            start: source.start,
            duration: source.buffer.duration(),
            routing: source.routing,
        });
    }

    fn stop_source(&self, id: SourceId) {
        let mut state = self.state.lock();
        if state.mixer.remove(id) {
            state.stopped.push(id);
        }
    }

    fn frequency_data(&self, tap: Tap, out: &mut [u8]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let frame = state.mixer.frame_at(state.clock.now());
        let analyser = match tap {
            Tap::Speaker => &mut state.speaker,
            Tap::Visualizer => &mut state.visualizer,
        };
        let window = state.mixer.render_window(tap, frame, analyser.fft_size());
        analyser.load_window(&window);
        analyser.byte_frequency_data(out);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.clock.freeze();
        state.mixer.clear();
        state.engine = EngineState::Closed;
    }
}
