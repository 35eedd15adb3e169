//! Sound-card audio sink
//!
//! The cpal stream lives on a dedicated thread; the sink talks to it over a
//! command channel. The number of frames rendered at the sink rate is the
//! audio clock, so it stops while the stream is paused. Devices that cannot
//! run at the sink rate open at their own rate and the rendered audio is
//! resampled on the way out.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::buffer::{create_shared_buffer, AudioFrame, SharedRingBuffer};
use crate::audio::device::{resolve_device, stream_config, Direction};
use crate::audio::mixer::Mixer;
use crate::audio::resample::StreamResampler;
use crate::audio::sink::{AudioSink, EngineState, ScheduledSource, SourceId, Tap};
use crate::constants::RING_BUFFER_CAPACITY;
use crate::error::AudioError;

const STATE_RUNNING: u8 = 0;
const STATE_SUSPENDED: u8 = 1;
const STATE_CLOSED: u8 = 2;

enum StreamCommand {
    Play(Sender<Result<(), AudioError>>),
    Close,
}

/// State shared with the device callback
struct SinkShared {
    mixer: Mutex<Mixer>,
    frames_rendered: AtomicU64,
    state: AtomicU8,
    speaker: Mutex<SpectrumAnalyser>,
    visualizer: Mutex<SpectrumAnalyser>,
    /// Speaker tap for echo cancellation
    reference: SharedRingBuffer,
    reference_sequence: AtomicU32,
}

impl SinkShared {
    fn new(sample_rate: u32, fft_size: usize) -> Self {
        Self {
            mixer: Mutex::new(Mixer::new(sample_rate)),
            frames_rendered: AtomicU64::new(0),
            state: AtomicU8::new(STATE_SUSPENDED),
            speaker: Mutex::new(SpectrumAnalyser::new(fft_size)),
            visualizer: Mutex::new(SpectrumAnalyser::new(fft_size)),
            reference: create_shared_buffer(RING_BUFFER_CAPACITY),
            reference_sequence: AtomicU32::new(0),
        }
    }
}

/// Mixer output at the sink rate, written out at the device rate
struct Renderer {
    shared: Arc<SinkShared>,
    resampler: Option<StreamResampler>,
    /// Sink-rate frames per render step when resampling
    block: usize,
    speaker: Vec<f32>,
    visual: Vec<f32>,
    /// Device-rate speaker samples not yet handed to the device
    backlog: VecDeque<f32>,
}

impl Renderer {
    fn new(shared: Arc<SinkShared>, sink_rate: u32, device_rate: u32) -> Result<Self, AudioError> {
        let resampler = if sink_rate == device_rate {
            None
        } else {
            Some(StreamResampler::new(sink_rate, device_rate)?)
        };
        let block = resampler.as_ref().map(StreamResampler::chunk_size).unwrap_or(0);
        Ok(Self {
            shared,
            resampler,
            block,
            speaker: Vec::new(),
            visual: Vec::new(),
            backlog: VecDeque::new(),
        })
    }

    /// Fill an interleaved device buffer `channels` wide
    fn fill(&mut self, data: &mut [f32], channels: usize) {
        let frames = data.len() / channels;

        while self.backlog.len() < frames {
            let wanted = match self.resampler {
                Some(_) => self.block,
                None => frames - self.backlog.len(),
            };
            self.render_block(wanted);

            let converted = match &mut self.resampler {
                Some(resampler) => resampler.process(&self.speaker),
                None => {
                    self.backlog.extend(self.speaker.iter().copied());
                    continue;
                }
            };
            match converted {
                Ok(samples) => self.backlog.extend(samples),
                Err(e) => {
                    tracing::warn!("Output resampling failed, writing silence: {}", e);
                    let missing = frames - self.backlog.len();
                    self.backlog.extend(std::iter::repeat(0.0).take(missing));
                }
            }
        }

        for frame in data.chunks_mut(channels) {
            let sample = self.backlog.pop_front().unwrap_or(0.0).clamp(-1.0, 1.0);
            frame.iter_mut().for_each(|out| *out = sample);
        }
    }

    /// Render `frames` at the sink rate and advance the clock
    fn render_block(&mut self, frames: usize) {
        self.speaker.resize(frames, 0.0);
        self.visual.resize(frames, 0.0);
        let first = self.shared.frames_rendered.load(Ordering::Relaxed);

        // Never block the device thread; a contended lock renders silence
        match self.shared.mixer.try_lock() {
            Some(mut mixer) => {
                mixer.prune(first);
                mixer.render(Tap::Speaker, first, &mut self.speaker);
                mixer.render(Tap::Visualizer, first, &mut self.visual);
            }
            None => {
                self.speaker.iter_mut().for_each(|s| *s = 0.0);
                self.visual.iter_mut().for_each(|s| *s = 0.0);
            }
        }

        if let Some(mut analyser) = self.shared.speaker.try_lock() {
            analyser.push_samples(&self.speaker);
        }
        if let Some(mut analyser) = self.shared.visualizer.try_lock() {
            analyser.push_samples(&self.visual);
        }
        let sequence = self.shared.reference_sequence.fetch_add(1, Ordering::Relaxed);
        // Nobody drains the reference unless echo cancellation runs
        let _ = self
            .shared
            .reference
            .push(AudioFrame::new(self.speaker.clone(), 1, first, sequence));

        self.shared.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }
}

pub struct CpalSink {
    sample_rate: u32,
    shared: Arc<SinkShared>,
    commands: Sender<StreamCommand>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSink {
    /// Open an output stream for audio at `sample_rate` on the chosen device
    ///
    /// The device runs at `sample_rate` when it can, otherwise at its own
    /// default rate with resampling in the render path.
    pub fn open(device_id: Option<&str>, sample_rate: u32, fft_size: usize) -> Result<Arc<Self>, AudioError> {
        let device = resolve_device(device_id, Direction::Output)?;
        let config = stream_config(&device, Direction::Output, sample_rate)?;
        let device_rate = config.sample_rate.0;

        let shared = Arc::new(SinkShared::new(sample_rate, fft_size));
        let renderer = Renderer::new(shared.clone(), sample_rate, device_rate)?;

        let (command_tx, command_rx) = unbounded::<StreamCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name("voice-output".into())
            .spawn(move || run_stream(device, config, renderer, thread_shared, command_rx, ready_tx))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("output thread exited".into()))??;

        tracing::info!("Output stream opened: {} Hz audio, device at {} Hz", sample_rate, device_rate);

        Ok(Arc::new(Self {
            sample_rate,
            shared,
            commands: command_tx,
            thread_handle: Mutex::new(Some(handle)),
        }))
    }
}

fn run_stream(
    device: cpal::Device,
    config: StreamConfig,
    mut renderer: Renderer,
    shared: Arc<SinkShared>,
    commands: Receiver<StreamCommand>,
    ready: Sender<Result<(), AudioError>>,
) {
    let channels = config.channels.max(1) as usize;

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            renderer.fill(data, channels);
        },
        |err| {
            tracing::error!("Output stream error: {}", err);
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(AudioError::StreamError(e.to_string())));
            return;
        }
    };

    // Opened suspended; the scheduler resumes it before the first source
    let _ = stream.pause();
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::ResumeFailed(e.to_string()));
                if result.is_ok() {
                    shared.state.store(STATE_RUNNING, Ordering::SeqCst);
                }
                let _ = reply.send(result);
            }
            StreamCommand::Close => break,
        }
    }

    shared.state.store(STATE_CLOSED, Ordering::SeqCst);
    // Stream is dropped here, releasing the device
}

#[async_trait]
impl AudioSink for CpalSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.shared.frames_rendered.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn state(&self) -> EngineState {
        match self.shared.state.load(Ordering::SeqCst) {
            STATE_RUNNING => EngineState::Running,
            STATE_SUSPENDED => EngineState::Suspended,
            _ => EngineState::Closed,
        }
    }

    async fn resume(&self) -> Result<(), AudioError> {
        if self.state() == EngineState::Closed {
            return Err(AudioError::Closed);
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| AudioError::Closed)?;
        tokio::task::spawn_blocking(move || reply_rx.recv())
            .await
            .map_err(|e| AudioError::ResumeFailed(e.to_string()))?
            .map_err(|_| AudioError::Closed)?
    }

    fn start_source(&self, source: ScheduledSource) {
        self.shared.mixer.lock().add(&source);
    }

    fn stop_source(&self, id: SourceId) {
        self.shared.mixer.lock().remove(id);
    }

    fn frequency_data(&self, tap: Tap, out: &mut [u8]) {
        let analyser = match tap {
            Tap::Speaker => &self.shared.speaker,
            Tap::Visualizer => &self.shared.visualizer,
        };
        analyser.lock().byte_frequency_data(out);
    }

    fn echo_reference(&self) -> Option<SharedRingBuffer> {
        Some(self.shared.reference.clone())
    }

    fn close(&self) {
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
        self.shared.mixer.lock().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::PcmBuffer;
    use crate::audio::sink::Routing;

    fn shared_with_tone(sample_rate: u32, level: f32) -> Arc<SinkShared> {
        let shared = Arc::new(SinkShared::new(sample_rate, 256));
        shared.mixer.lock().add(&ScheduledSource {
            id: 1,
            buffer: Arc::new(PcmBuffer::new(vec![level; sample_rate as usize], sample_rate)),
            start: 0.0,
            routing: Routing::for_mute_state(false),
        });
        shared
    }

    #[test]
    fn test_same_rate_renders_straight_through() {
        let shared = shared_with_tone(24_000, 0.5);
        let mut renderer = Renderer::new(shared.clone(), 24_000, 24_000).unwrap();
        let mut data = vec![0.0; 512 * 2];

        renderer.fill(&mut data, 2);

        assert_eq!(shared.frames_rendered.load(Ordering::Relaxed), 512);
        assert!(data.iter().all(|&s| s == 0.5));
        assert_eq!(shared.reference.try_pop().map(|f| f.samples.len()), Some(512));
    }

    #[test]
    fn test_device_rate_fallback_resamples() {
        let shared = shared_with_tone(24_000, 0.5);
        let mut renderer = Renderer::new(shared.clone(), 24_000, 48_000).unwrap();
        let mut data = vec![0.0; 960 * 2];

        for _ in 0..10 {
            renderer.fill(&mut data, 2);
        }

        // The clock counts sink-rate frames, in 10 ms render steps
        let rendered = shared.frames_rendered.load(Ordering::Relaxed);
        assert_eq!(rendered % 240, 0);
        assert!((4_800..=6_000).contains(&rendered), "{}", rendered);

        // Both channels carry the tone once the filter has settled
        let (left, right) = (data[960], data[961]);
        assert_eq!(left, right);
        assert!((left - 0.5).abs() < 0.02, "{}", left);
    }
}
