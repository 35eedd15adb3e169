//! Collaborator-facing voice client
//!
//! Wires the session transport, capture, playback, cancellation and meter
//! together and exposes the small surface a UI needs: connect, microphone
//! and mute toggles, provider switch, interruption, and an event stream.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::audio::capture::{CaptureEngine, Microphone};
use crate::audio::meter::{MeterBridge, MeterSnapshot};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::processing::ProcessingSettings;
use crate::audio::sink::AudioSink;
use crate::cancel::CancellationCoordinator;
use crate::codec::{chunk_from_envelope, ChunkDecoder};
use crate::config::{AppConfig, ProviderProfile};
use crate::error::{AudioError, CaptureError, TransportError};
use crate::network::{ConnectionState, MessageTransport, SessionTransport, Subscription};
use crate::protocol::{Channel, Envelope, MessageKind};

/// Builds an output sink for a sample rate (called again on provider switch)
pub type SinkFactory = Arc<dyn Fn(u32) -> Result<Arc<dyn AudioSink>, AudioError> + Send + Sync>;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    Recording(bool),
    Playing(bool),
    /// Non-audio envelope from the service, untouched
    Message(Envelope),
}

pub struct VoiceClient {
    profile: Mutex<ProviderProfile>,
    transport: Arc<SessionTransport>,
    scheduler: Arc<PlaybackScheduler>,
    coordinator: Arc<CancellationCoordinator>,
    capture: Arc<CaptureEngine>,
    meter: Arc<MeterBridge>,
    sink_factory: SinkFactory,
    events: broadcast::Sender<ClientEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceClient {
    /// Build the pipeline; must be called inside a tokio runtime
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn MessageTransport>,
        microphone: Arc<dyn Microphone>,
        sink_factory: SinkFactory,
    ) -> Result<Arc<Self>, AudioError> {
        let profile = config.profile();
        let sink = sink_factory(profile.output_sample_rate)?;

        let scheduler = PlaybackScheduler::new(
            sink,
            ChunkDecoder::default(),
            Duration::from_millis(config.playback.lookahead_ms),
        );
        scheduler.set_muted(config.playback.start_muted);

        let session = SessionTransport::new(transport, &config.server, &config.reconnect);
        let coordinator = CancellationCoordinator::new(scheduler.clone(), session.clone());
        let capture = CaptureEngine::new(
            session.clone(),
            coordinator.clone(),
            microphone,
            &config.capture,
            profile.input_sample_rate,
            config.meter.capture_fft_size,
        );
        let meter = MeterBridge::new(capture.clone(), scheduler.clone(), &config.meter);
        meter.set_speaker_enabled(!config.playback.start_muted);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(
            "Voice client for provider {} ({} Hz in, {} Hz out)",
            profile.name,
            profile.input_sample_rate,
            profile.output_sample_rate
        );

        let client = Arc::new(Self {
            profile: Mutex::new(profile),
            transport: session,
            scheduler,
            coordinator,
            capture,
            meter,
            sink_factory,
            events,
            forwarders: Mutex::new(Vec::new()),
        });
        client.register_handlers();
        client.spawn_forwarders();
        client.meter.start();
        Ok(client)
    }

    fn register_handlers(&self) {
        let scheduler = self.scheduler.clone();
        self.transport.on(Subscription::Kind(MessageKind::OutputAudio), move |envelope| {
            match chunk_from_envelope(envelope) {
                Ok(chunk) => scheduler.enqueue(chunk),
                Err(e) => tracing::warn!("Dropping output audio: {}", e),
            }
        });

        let coordinator = self.coordinator.clone();
        self.transport.on(Subscription::Kind(MessageKind::CancelAudio), move |_| {
            coordinator.on_remote_cancel();
        });

        let events = self.events.clone();
        self.transport.on(Subscription::All, move |envelope| {
            if !envelope.kind.is_audio() {
                let _ = events.send(ClientEvent::Message(envelope.clone()));
            }
        });
    }

    fn spawn_forwarders(&self) {
        let mut forwarders = self.forwarders.lock();
        forwarders.push(forward(
            self.transport.subscribe_state(),
            self.events.clone(),
            ClientEvent::ConnectionChanged,
        ));
        forwarders.push(forward(
            self.capture.subscribe_recording(),
            self.events.clone(),
            ClientEvent::Recording,
        ));
        forwarders.push(forward(
            self.scheduler.subscribe_playing(),
            self.events.clone(),
            ClientEvent::Playing,
        ));
    }

    pub async fn connect(&self) -> Result<String, TransportError> {
        self.transport.connect().await
    }

    pub fn disconnect(&self) {
        self.stop_microphone();
        self.scheduler.cancel();
        self.transport.disconnect();
    }

    pub fn start_microphone(&self) -> Result<(), CaptureError> {
        self.capture.start()?;
        self.meter.set_mic_enabled(true);
        Ok(())
    }

    pub fn stop_microphone(&self) {
        self.capture.stop();
        self.meter.set_mic_enabled(false);
    }

    /// Muting keeps the visualizer path, so the output meter still moves
    pub fn set_output_muted(&self, muted: bool) {
        self.scheduler.set_muted(muted);
        self.meter.set_speaker_enabled(!muted);
    }

    /// Switch speech provider; rebuilds the output sink at the new rate
    pub fn set_provider(&self, name: &str) -> Result<(), AudioError> {
        let profile = ProviderProfile::from_name(name);
        let sink = (self.sink_factory)(profile.output_sample_rate)?;
        self.scheduler.rebuild(sink);
        self.capture.set_sample_rate(profile.input_sample_rate);
        tracing::info!(
            "Provider switched to {} ({} Hz capture)",
            profile.name,
            profile.input_sample_rate
        );
        *self.profile.lock() = profile;
        Ok(())
    }

    /// Interrupt the assistant; true when something was playing
    pub fn cancel(&self) -> bool {
        self.coordinator.cancel()
    }

    pub fn send_text(&self, text: &str, output_channel: Channel) -> bool {
        self.transport.send_input_text(text, output_channel)
    }

    /// Tear everything down; the client is unusable afterwards
    pub fn shutdown(&self) {
        self.stop_microphone();
        self.transport.disconnect();
        self.scheduler.close();
        for subscription in [
            Subscription::Kind(MessageKind::OutputAudio),
            Subscription::Kind(MessageKind::CancelAudio),
            Subscription::All,
        ] {
            self.transport.off(&subscription, None);
        }
        for forwarder in self.forwarders.lock().drain(..) {
            forwarder.abort();
        }
        tracing::info!("Voice client shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn meter(&self) -> watch::Receiver<MeterSnapshot> {
        self.meter.subscribe()
    }

    pub fn profile(&self) -> ProviderProfile {
        self.profile.lock().clone()
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    /// Processing stages applied to the running microphone
    pub fn capture_processing(&self) -> Option<ProcessingSettings> {
        self.capture.processing()
    }
}

/// Re-publish a watch channel's changes as client events
fn forward<T, F>(
    mut changes: watch::Receiver<T>,
    events: broadcast::Sender<ClientEvent>,
    to_event: F,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> ClientEvent + Send + 'static,
{
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let value = changes.borrow_and_update().clone();
            let _ = events.send(to_event(value));
        }
    })
}
