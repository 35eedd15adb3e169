//! Microphone capture and the outbound frame pump
//!
//! The device callback pushes raw blocks into a lock-free ring buffer. A
//! tokio task drains it, mixes to mono, runs the processing chain, feeds the
//! capture analyser and cuts fixed-size frames that go out as `input_audio`
//! envelopes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::meter::LevelSource;
use crate::audio::processing::{
    CaptureProcessing, EchoReference, ProcessingSettings, PROCESSING_SAMPLE_RATE,
};
use crate::audio::resample::StreamResampler;
use crate::cancel::CancellationCoordinator;
use crate::codec::pcm::encode_frame;
use crate::config::CaptureConfig;
use crate::constants::{CAPTURE_CHANNELS, RING_BUFFER_CAPACITY};
use crate::error::{AudioError, CaptureError};
use crate::network::SessionTransport;
use crate::protocol::Envelope;

/// How often the pump drains the ring buffer
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// What the engine asks the microphone for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub device_id: Option<String>,
}

/// A running hardware stream
pub trait MicrophoneStream: Send {
    /// Rate the device actually delivers
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Stop the hardware stream; safe to call twice
    fn stop(&mut self);
}

/// Source of microphone streams
pub trait Microphone: Send + Sync {
    /// Start capturing into `output`
    fn open(
        &self,
        request: &CaptureRequest,
        output: SharedRingBuffer,
    ) -> Result<Box<dyn MicrophoneStream>, CaptureError>;
}

struct ActiveCapture {
    stream: Box<dyn MicrophoneStream>,
    pump: JoinHandle<()>,
    processing: Option<ProcessingSettings>,
}

pub struct CaptureEngine {
    transport: Arc<SessionTransport>,
    coordinator: Arc<CancellationCoordinator>,
    microphone: Arc<dyn Microphone>,
    request: Mutex<CaptureRequest>,
    frame_samples: usize,
    analyser: Arc<Mutex<SpectrumAnalyser>>,
    active: Mutex<Option<ActiveCapture>>,
    recording: watch::Sender<bool>,
}

impl CaptureEngine {
    pub fn new(
        transport: Arc<SessionTransport>,
        coordinator: Arc<CancellationCoordinator>,
        microphone: Arc<dyn Microphone>,
        config: &CaptureConfig,
        sample_rate: u32,
        fft_size: usize,
    ) -> Arc<Self> {
        let (recording, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            coordinator,
            microphone,
            request: Mutex::new(CaptureRequest {
                sample_rate,
                channels: CAPTURE_CHANNELS,
                echo_cancellation: config.echo_cancellation,
                noise_suppression: config.noise_suppression,
                auto_gain_control: config.auto_gain_control,
                device_id: config.device_id.clone(),
            }),
            frame_samples: config.frame_samples.max(1),
            analyser: Arc::new(Mutex::new(SpectrumAnalyser::new(fft_size))),
            active: Mutex::new(None),
            recording,
        })
    }

    /// Open the microphone and start sending frames
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Ok(());
        }
        if !self.transport.is_connected() {
            tracing::warn!("Microphone not started: transport is not open");
            return Err(CaptureError::NotConnected);
        }

        let request = self.request.lock().clone();
        let buffer = create_shared_buffer(RING_BUFFER_CAPACITY);
        let mut stream = self.microphone.open(&request, buffer.clone()).map_err(|e| {
            tracing::error!("Microphone open failed: {}", e);
            e
        })?;

        tracing::info!(
            "Capture started: {} Hz requested, device delivers {} Hz x{}",
            request.sample_rate,
            stream.sample_rate(),
            stream.channels()
        );

        let chain = match self.build_chain(&request, stream.sample_rate()) {
            Ok(chain) => chain,
            Err(e) => {
                stream.stop();
                return Err(e);
            }
        };
        let processing = chain.processing();

        let pump = FramePump {
            buffer,
            chain,
            frame_samples: self.frame_samples,
            transport: self.transport.clone(),
            coordinator: self.coordinator.clone(),
            analyser: self.analyser.clone(),
        };
        *active = Some(ActiveCapture {
            stream,
            pump: tokio::spawn(pump.run()),
            processing,
        });
        drop(active);

        self.recording.send_replace(true);
        Ok(())
    }

    /// Device rate to request rate, through voice processing when any flag is on
    fn build_chain(&self, request: &CaptureRequest, device_rate: u32) -> Result<CaptureChain, CaptureError> {
        let settings = ProcessingSettings::from_request(request);
        if settings.is_enabled() {
            let reference = if settings.echo_cancellation {
                self.echo_reference()
            } else {
                None
            };
            let chain = CaptureProcessing::new(settings, reference).and_then(|processing| {
                CaptureChain::processed(device_rate, request.sample_rate, processing)
            });
            match chain {
                Ok(chain) => return Ok(chain),
                Err(e) => tracing::warn!("Voice processing unavailable, sending raw audio: {}", e),
            }
        }
        CaptureChain::direct(device_rate, request.sample_rate)
            .map_err(|e| CaptureError::Unavailable(e.to_string()))
    }

    fn echo_reference(&self) -> Option<EchoReference> {
        let sink = self.coordinator.scheduler().sink();
        let source = sink.echo_reference()?;
        match EchoReference::new(source, sink.sample_rate()) {
            Ok(reference) => Some(reference),
            Err(e) => {
                tracing::warn!("Echo cancellation runs without a speaker reference: {}", e);
                None
            }
        }
    }

    /// Stop the pump and release the device
    pub fn stop(&self) {
        let Some(mut capture) = self.active.lock().take() else {
            return;
        };
        capture.pump.abort();
        capture.stream.stop();
        self.analyser.lock().reset();
        self.recording.send_replace(false);
        tracing::info!("Capture stopped");
    }

    /// Takes effect on the next `start`
    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.request.lock().sample_rate = sample_rate;
    }

    pub fn sample_rate(&self) -> u32 {
        self.request.lock().sample_rate
    }

    /// Processing stages of the running capture, `None` when audio goes out raw
    pub fn processing(&self) -> Option<ProcessingSettings> {
        self.active.lock().as_ref().and_then(|capture| capture.processing)
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn subscribe_recording(&self) -> watch::Receiver<bool> {
        self.recording.subscribe()
    }
}

impl LevelSource for CaptureEngine {
    fn fill_levels(&self, out: &mut [u8]) -> bool {
        if !self.is_recording() {
            return false;
        }
        self.analyser.lock().byte_frequency_data(out);
        true
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resampler_between(from_rate: u32, to_rate: u32) -> Result<Option<StreamResampler>, AudioError> {
    if from_rate == to_rate {
        Ok(None)
    } else {
        StreamResampler::new(from_rate, to_rate).map(Some)
    }
}

/// Mono at the device rate in, mono at the request rate out
enum CaptureChain {
    Direct(Option<StreamResampler>),
    Processed {
        to_engine: Option<StreamResampler>,
        processing: CaptureProcessing,
        from_engine: Option<StreamResampler>,
    },
}

impl CaptureChain {
    fn direct(device_rate: u32, target_rate: u32) -> Result<Self, AudioError> {
        Ok(CaptureChain::Direct(resampler_between(device_rate, target_rate)?))
    }

    fn processed(device_rate: u32, target_rate: u32, processing: CaptureProcessing) -> Result<Self, AudioError> {
        Ok(CaptureChain::Processed {
            to_engine: resampler_between(device_rate, PROCESSING_SAMPLE_RATE)?,
            processing,
            from_engine: resampler_between(PROCESSING_SAMPLE_RATE, target_rate)?,
        })
    }

    fn processing(&self) -> Option<ProcessingSettings> {
        match self {
            CaptureChain::Direct(_) => None,
            CaptureChain::Processed { processing, .. } => Some(processing.settings()),
        }
    }

    fn process(&mut self, mono: Vec<f32>) -> Result<Vec<f32>, AudioError> {
        match self {
            CaptureChain::Direct(None) => Ok(mono),
            CaptureChain::Direct(Some(resampler)) => resampler.process(&mono),
            CaptureChain::Processed {
                to_engine,
                processing,
                from_engine,
            } => {
                let at_engine_rate = match to_engine {
                    Some(resampler) => resampler.process(&mono)?,
                    None => mono,
                };
                let cleaned = processing.process(&at_engine_rate)?;
                match from_engine {
                    Some(resampler) => resampler.process(&cleaned),
                    None => Ok(cleaned),
                }
            }
        }
    }
}

/// Ring buffer to wire
struct FramePump {
    buffer: SharedRingBuffer,
    chain: CaptureChain,
    frame_samples: usize,
    transport: Arc<SessionTransport>,
    coordinator: Arc<CancellationCoordinator>,
    analyser: Arc<Mutex<SpectrumAnalyser>>,
}

impl FramePump {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(PUMP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Vec<f32> = Vec::with_capacity(self.frame_samples * 2);
        let mut burst_started = false;
        let mut sent: u64 = 0;

        loop {
            ticker.tick().await;

            let mut mono = Vec::new();
            while let Some(frame) = self.buffer.try_pop() {
                frame.mix_to_mono(&mut mono);
            }
            if mono.is_empty() {
                continue;
            }
            let mono = match self.chain.process(mono) {
                Ok(mono) if mono.is_empty() => continue,
                Ok(mono) => mono,
                Err(e) => {
                    tracing::warn!("Dropping capture block: {}", e);
                    continue;
                }
            };

            self.analyser.lock().push_samples(&mono);
            pending.extend_from_slice(&mono);

            while pending.len() >= self.frame_samples {
                let frame: Vec<f32> = pending.drain(..self.frame_samples).collect();
                if !self.transport.is_connected() {
                    tracing::debug!("Dropping capture frame while disconnected");
                    continue;
                }
                if !burst_started {
                    burst_started = true;
                    self.coordinator.cancel();
                }
                let envelope = Envelope::input_audio(self.transport.session_id(), encode_frame(&frame));
                if self.transport.send(&envelope) {
                    sent += 1;
                    tracing::trace!("Sent capture frame {}", sent);
                }
            }
        }
    }
}

#[cfg(feature = "device")]
pub use device::CpalMicrophone;

#[cfg(feature = "device")]
mod device {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::BuildStreamError;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    use super::{CaptureRequest, Microphone, MicrophoneStream};
    use crate::audio::buffer::{AudioFrame, SharedRingBuffer};
    use crate::audio::device::{resolve_device, stream_config, Direction};
    use crate::error::CaptureError;

    /// Input device backed by cpal
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalMicrophone;

    pub struct CpalMicStream {
        running: Arc<AtomicBool>,
        thread_handle: Option<JoinHandle<()>>,
        sample_rate: u32,
        channels: u16,
    }

    impl MicrophoneStream for CpalMicStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }

    impl Drop for CpalMicStream {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn classify(error: BuildStreamError) -> CaptureError {
        let message = error.to_string();
        match error {
            BuildStreamError::DeviceNotAvailable => CaptureError::Unavailable(message),
            _ if message.to_ascii_lowercase().contains("permission") => {
                CaptureError::PermissionDenied(message)
            }
            _ => CaptureError::Unavailable(message),
        }
    }

    impl Microphone for CpalMicrophone {
        fn open(
            &self,
            request: &CaptureRequest,
            output: SharedRingBuffer,
        ) -> Result<Box<dyn MicrophoneStream>, CaptureError> {
            let device = resolve_device(request.device_id.as_deref(), Direction::Input)
                .map_err(|e| CaptureError::DeviceNotFound(e.to_string()))?;
            let config = stream_config(&device, Direction::Input, request.sample_rate)
                .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

            let running = Arc::new(AtomicBool::new(true));
            let running_for_loop = running.clone();
            let running_for_callback = running.clone();
            let channels = config.channels;
            let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);
            let stream_config = config.clone();

            let handle = thread::Builder::new()
                .name("voice-capture".into())
                .spawn(move || {
                    let sequence = AtomicU32::new(0);
                    let start_time = Instant::now();

                    let stream = device.build_input_stream(
                        &stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if !running_for_callback.load(Ordering::Relaxed) {
                                return;
                            }
                            let frame = AudioFrame::new(
                                data.to_vec(),
                                channels,
                                start_time.elapsed().as_micros() as u64,
                                sequence.fetch_add(1, Ordering::Relaxed),
                            );
                            // Overflow drops the block; the pump is behind
                            let _ = output.push(frame);
                        },
                        |err| {
                            tracing::error!("Input stream error: {}", err);
                        },
                        None,
                    );

                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(classify(e)));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(CaptureError::Unavailable(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running_for_loop.load(Ordering::Relaxed) {
                        thread::sleep(std::time::Duration::from_millis(10));
                    }
                    // Stream is dropped here, stopping capture
                })
                .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

            let mut stream = CpalMicStream {
                running,
                thread_handle: Some(handle),
                sample_rate: config.sample_rate.0,
                channels,
            };

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(stream)),
                Ok(Err(e)) => {
                    stream.stop();
                    Err(e)
                }
                Err(_) => {
                    stream.stop();
                    Err(CaptureError::Unavailable("capture thread exited".into()))
                }
            }
        }
    }
}
