//! Bar-graph level meter for the microphone and the assistant voice
//!
//! A single polling loop reads byte spectra from two [`LevelSource`]s and
//! publishes bar heights (fractions of full scale) on a watch channel.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::MeterConfig;

/// Anything that can report a byte spectrum for the meter
pub trait LevelSource: Send + Sync {
    /// Fill `out` with one byte per bin; false when the source is inactive
    fn fill_levels(&self, out: &mut [u8]) -> bool;
}

/// Fixed number of bars, heights in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct BarArray {
    heights: Vec<f32>,
    active_floor: f32,
    idle_floor: f32,
}

impl BarArray {
    pub fn new(count: usize, active_floor: f32, idle_floor: f32) -> Self {
        Self {
            heights: vec![idle_floor; count],
            active_floor,
            idle_floor,
        }
    }

    /// Bar `i` follows bin `i`, never dropping below the active floor
    pub fn apply(&mut self, levels: &[u8]) {
        for (i, height) in self.heights.iter_mut().enumerate() {
            let value = levels.get(i).copied().unwrap_or(0) as f32 / 255.0;
            *height = value.max(self.active_floor);
        }
    }

    pub fn reset(&mut self) {
        self.heights.iter_mut().for_each(|h| *h = self.idle_floor);
    }

    pub fn heights(&self) -> &[f32] {
        &self.heights
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeterSnapshot {
    pub visible: bool,
    pub input: Vec<f32>,
    pub output: Vec<f32>,
}

struct MeterState {
    mic_enabled: bool,
    speaker_enabled: bool,
    input: BarArray,
    output: BarArray,
    scratch: Vec<u8>,
}

impl MeterState {
    fn visible(&self) -> bool {
        self.mic_enabled || self.speaker_enabled
    }

    fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            visible: self.visible(),
            input: self.input.heights().to_vec(),
            output: self.output.heights().to_vec(),
        }
    }
}

pub struct MeterBridge {
    input: Arc<dyn LevelSource>,
    output: Arc<dyn LevelSource>,
    state: Mutex<MeterState>,
    snapshots: watch::Sender<MeterSnapshot>,
    interval: Duration,
    loop_started: AtomicBool,
}

impl MeterBridge {
    pub fn new(input: Arc<dyn LevelSource>, output: Arc<dyn LevelSource>, config: &MeterConfig) -> Arc<Self> {
        let state = MeterState {
            mic_enabled: false,
            speaker_enabled: false,
            input: BarArray::new(config.bar_count, config.active_floor, config.idle_floor),
            output: BarArray::new(config.bar_count, config.active_floor, config.idle_floor),
            scratch: vec![0; config.bar_count],
        };
        let (snapshots, _) = watch::channel(state.snapshot());
        Arc::new(Self {
            input,
            output,
            state: Mutex::new(state),
            snapshots,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            loop_started: AtomicBool::new(false),
        })
    }

    /// Spawn the polling loop; later calls return false and do nothing
    pub fn start(self: &Arc<Self>) -> bool {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let bridge: Weak<Self> = Arc::downgrade(self);
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match bridge.upgrade() {
                    Some(bridge) => bridge.tick(),
                    None => break,
                }
            }
            tracing::debug!("Meter loop stopped");
        });
        true
    }

    /// Poll both sources once
    pub fn tick(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut changed = false;

        state.scratch.fill(0);
        if self.input.fill_levels(&mut state.scratch) {
            state.input.apply(&state.scratch);
            changed = true;
        }

        state.scratch.fill(0);
        if self.output.fill_levels(&mut state.scratch) {
            state.output.apply(&state.scratch);
            changed = true;
        }

        if changed {
            self.snapshots.send_replace(state.snapshot());
        }
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        self.update_visibility(|state| state.mic_enabled = enabled);
    }

    pub fn set_speaker_enabled(&self, enabled: bool) {
        self.update_visibility(|state| state.speaker_enabled = enabled);
    }

    fn update_visibility(&self, change: impl FnOnce(&mut MeterState)) {
        let mut state = self.state.lock();
        let was_visible = state.visible();
        let (mic_before, speaker_before) = (state.mic_enabled, state.speaker_enabled);
        change(&mut state);

        match (was_visible, state.visible()) {
            (false, true) | (true, false) => {
                state.input.reset();
                state.output.reset();
            }
            (true, true) => {
                if mic_before && !state.mic_enabled {
                    state.input.reset();
                }
                if speaker_before && !state.speaker_enabled {
                    state.output.reset();
                }
            }
            (false, false) => {}
        }

        self.snapshots.send_replace(state.snapshot());
    }

    pub fn is_visible(&self) -> bool {
        self.state.lock().visible()
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeterSnapshot> {
        self.snapshots.subscribe()
    }
}
