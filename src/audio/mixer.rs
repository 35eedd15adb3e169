//! Sample-accurate mixing of scheduled sources
//!
//! Shared by every [`AudioSink`](crate::audio::AudioSink) implementation.
//! Positions are absolute frame indices on the sink clock.

use std::sync::Arc;

use crate::audio::buffer::PcmBuffer;
use crate::audio::sink::{Routing, ScheduledSource, SourceId, Tap};

struct MixerSource {
    id: SourceId,
    buffer: Arc<PcmBuffer>,
    start_frame: u64,
    routing: Routing,
}

impl MixerSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.len() as u64
    }
}

/// Set of sources placed on a frame timeline
pub struct Mixer {
    sample_rate: u32,
    sources: Vec<MixerSource>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            sources: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds on the sink clock to a frame index
    pub fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    pub fn add(&mut self, source: &ScheduledSource) {
        self.sources.push(MixerSource {
            id: source.id,
            buffer: source.buffer.clone(),
            start_frame: self.frame_at(source.start),
            routing: source.routing,
        });
    }

    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|source| source.id != id);
        self.sources.len() != before
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    /// Drop sources that finished before `frame`
    pub fn prune(&mut self, frame: u64) {
        self.sources.retain(|source| source.end_frame() > frame);
    }

    /// Sources that have not finished by `frame`
    pub fn active_ids(&self, frame: u64) -> Vec<SourceId> {
        self.sources
            .iter()
            .filter(|source| source.end_frame() > frame)
            .map(|source| source.id)
            .collect()
    }

    /// Overwrite `out` with the tap's mix starting at `first_frame`
    pub fn render(&self, tap: Tap, first_frame: u64, out: &mut [f32]) {
        out.iter_mut().for_each(|sample| *sample = 0.0);
        let last_frame = first_frame + out.len() as u64;

        for source in self.sources.iter().filter(|s| s.routing.includes(tap)) {
            let from = source.start_frame.max(first_frame);
            let to = source.end_frame().min(last_frame);
            if from >= to {
                continue;
            }
            let samples = source.buffer.samples();
            for frame in from..to {
                out[(frame - first_frame) as usize] += samples[(frame - source.start_frame) as usize];
            }
        }
    }

    /// Mix of the `len` frames that end at `end_frame`
    pub fn render_window(&self, tap: Tap, end_frame: u64, len: usize) -> Vec<f32> {
        let first = end_frame.saturating_sub(len as u64);
        let mut out = vec![0.0; (end_frame - first) as usize];
        self.render(tap, first, &mut out);
        out
    }
}
