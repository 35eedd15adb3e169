//! Voice processing on the capture path
//!
//! Echo cancellation, noise suppression and gain control run through the
//! WebRTC audio processing module. The module only accepts 48 kHz mono in
//! 10 ms frames, so capture audio is brought to that rate before it gets
//! here. The far-end reference for echo cancellation is whatever the output
//! sink rendered to the speaker.

use crate::audio::buffer::SharedRingBuffer;
use crate::audio::capture::CaptureRequest;
use crate::audio::resample::StreamResampler;
use crate::error::AudioError;

/// Rate the processing module runs at
pub const PROCESSING_SAMPLE_RATE: u32 = 48_000;

/// One 10 ms processing frame
pub const PROCESSING_FRAME_SAMPLES: usize = 480;

/// Reference audio beyond this backlog is stale and gets dropped
const MAX_REFERENCE_BACKLOG: usize = PROCESSING_FRAME_SAMPLES * 20;

/// Which processing stages run on captured audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessingSettings {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl ProcessingSettings {
    pub fn from_request(request: &CaptureRequest) -> Self {
        Self {
            echo_cancellation: request.echo_cancellation,
            noise_suppression: request.noise_suppression,
            auto_gain_control: request.auto_gain_control,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.echo_cancellation || self.noise_suppression || self.auto_gain_control
    }
}

#[cfg(feature = "voice-processing")]
mod engine {
    use webrtc_audio_processing::{
        Config, EchoCancellation, EchoCancellationSuppressionLevel, GainControl, GainControlMode,
        InitializationConfig, NoiseSuppression, NoiseSuppressionLevel, Processor, VoiceDetection,
        VoiceDetectionLikelihood,
    };

    use super::ProcessingSettings;
    use crate::error::AudioError;

    pub struct Engine {
        processor: Processor,
    }

    impl Engine {
        pub fn new(settings: &ProcessingSettings) -> Result<Self, AudioError> {
            let init_config = InitializationConfig {
                num_capture_channels: 1,
                num_render_channels: 1,
                ..InitializationConfig::default()
            };
            let mut processor = Processor::new(&init_config)
                .map_err(|e| AudioError::Processing(format!("Failed to create processor: {}", e)))?;
            processor.set_config(build_config(settings));
            Ok(Self { processor })
        }

        pub fn process_capture(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
            self.processor
                .process_capture_frame(frame)
                .map_err(|e| AudioError::Processing(format!("Capture processing error: {}", e)))
        }

        pub fn process_render(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
            self.processor
                .process_render_frame(frame)
                .map_err(|e| AudioError::Processing(format!("Render processing error: {}", e)))
        }

        pub fn has_voice(&self) -> bool {
            self.processor.get_stats().has_voice.unwrap_or(false)
        }
    }

    pub fn build_config(settings: &ProcessingSettings) -> Config {
        Config {
            echo_cancellation: settings.echo_cancellation.then_some(EchoCancellation {
                suppression_level: EchoCancellationSuppressionLevel::Moderate,
                enable_extended_filter: true,
                enable_delay_agnostic: true,
                stream_delay_ms: None,
            }),
            gain_control: settings.auto_gain_control.then_some(GainControl {
                mode: GainControlMode::AdaptiveDigital,
                target_level_dbfs: 3,
                compression_gain_db: 9,
                enable_limiter: true,
            }),
            noise_suppression: settings.noise_suppression.then_some(NoiseSuppression {
                suppression_level: NoiseSuppressionLevel::Moderate,
            }),
            voice_detection: Some(VoiceDetection {
                detection_likelihood: VoiceDetectionLikelihood::High,
            }),
            enable_transient_suppressor: false,
            enable_high_pass_filter: true,
        }
    }
}

#[cfg(not(feature = "voice-processing"))]
mod engine {
    use super::ProcessingSettings;
    use crate::error::AudioError;

    pub struct Engine;

    impl Engine {
        pub fn new(_settings: &ProcessingSettings) -> Result<Self, AudioError> {
            Err(AudioError::Processing(
                "built without the voice-processing feature".into(),
            ))
        }

        pub fn process_capture(&mut self, _frame: &mut [f32]) -> Result<(), AudioError> {
            Ok(())
        }

        pub fn process_render(&mut self, _frame: &mut [f32]) -> Result<(), AudioError> {
            Ok(())
        }

        pub fn has_voice(&self) -> bool {
            false
        }
    }
}

/// WebRTC processing module configured from [`ProcessingSettings`]
pub struct VoiceProcessor {
    engine: engine::Engine,
    settings: ProcessingSettings,
}

impl VoiceProcessor {
    pub fn new(settings: ProcessingSettings) -> Result<Self, AudioError> {
        Ok(Self {
            engine: engine::Engine::new(&settings)?,
            settings,
        })
    }

    pub fn settings(&self) -> ProcessingSettings {
        self.settings
    }

    /// Whether the last capture frame held speech
    pub fn has_voice(&self) -> bool {
        self.engine.has_voice()
    }

    /// Clean one microphone frame in place
    pub fn process_capture_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
        check_frame(frame)?;
        self.engine.process_capture(frame)
    }

    /// Feed one frame of what the speaker played
    pub fn process_render_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
        check_frame(frame)?;
        self.engine.process_render(frame)
    }
}

fn check_frame(frame: &[f32]) -> Result<(), AudioError> {
    if frame.len() != PROCESSING_FRAME_SAMPLES {
        return Err(AudioError::Processing(format!(
            "Expected {} samples, got {}",
            PROCESSING_FRAME_SAMPLES,
            frame.len()
        )));
    }
    Ok(())
}

/// Speaker output brought to the processing rate
pub struct EchoReference {
    source: SharedRingBuffer,
    resampler: Option<StreamResampler>,
    pending: Vec<f32>,
}

impl EchoReference {
    /// `source` carries mono blocks rendered at `sample_rate`
    pub fn new(source: SharedRingBuffer, sample_rate: u32) -> Result<Self, AudioError> {
        let resampler = if sample_rate == PROCESSING_SAMPLE_RATE {
            None
        } else {
            Some(StreamResampler::new(sample_rate, PROCESSING_SAMPLE_RATE)?)
        };
        // Whatever played before capture started is of no use
        while source.try_pop().is_some() {}
        Ok(Self {
            source,
            resampler,
            pending: Vec::new(),
        })
    }

    fn collect(&mut self) -> Result<(), AudioError> {
        let mut rendered = Vec::new();
        while let Some(frame) = self.source.try_pop() {
            frame.mix_to_mono(&mut rendered);
        }
        if rendered.is_empty() {
            return Ok(());
        }
        let rendered = match &mut self.resampler {
            Some(resampler) => resampler.process(&rendered)?,
            None => rendered,
        };
        self.pending.extend_from_slice(&rendered);
        if self.pending.len() > MAX_REFERENCE_BACKLOG {
            let excess = self.pending.len() - MAX_REFERENCE_BACKLOG;
            self.pending.drain(..excess);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Vec<f32>> {
        (self.pending.len() >= PROCESSING_FRAME_SAMPLES)
            .then(|| self.pending.drain(..PROCESSING_FRAME_SAMPLES).collect())
    }
}

/// Frames 48 kHz capture audio through a [`VoiceProcessor`]
pub struct CaptureProcessing {
    processor: VoiceProcessor,
    reference: Option<EchoReference>,
    pending: Vec<f32>,
}

impl CaptureProcessing {
    pub fn new(settings: ProcessingSettings, reference: Option<EchoReference>) -> Result<Self, AudioError> {
        Ok(Self {
            processor: VoiceProcessor::new(settings)?,
            reference,
            pending: Vec::with_capacity(PROCESSING_FRAME_SAMPLES * 2),
        })
    }

    pub fn settings(&self) -> ProcessingSettings {
        self.processor.settings()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Mono samples at [`PROCESSING_SAMPLE_RATE`] in, whole processed frames out
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.pending.extend_from_slice(samples);
        if let Some(reference) = &mut self.reference {
            reference.collect()?;
        }

        let mut output = Vec::with_capacity(self.pending.len());
        while self.pending.len() >= PROCESSING_FRAME_SAMPLES {
            let mut frame: Vec<f32> = self.pending.drain(..PROCESSING_FRAME_SAMPLES).collect();
            if let Some(mut far_end) = self.reference.as_mut().and_then(EchoReference::next_frame) {
                self.processor.process_render_frame(&mut far_end)?;
            }
            self.processor.process_capture_frame(&mut frame)?;
            output.extend_from_slice(&frame);
        }
        Ok(output)
    }
}
