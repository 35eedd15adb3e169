use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use voice_duplex::audio::buffer::{AudioFrame, SharedRingBuffer};
use voice_duplex::audio::{AudioSink, CaptureRequest, Microphone, MicrophoneStream, VirtualSink};
use voice_duplex::client::SinkFactory;
use voice_duplex::config::AppConfig;
use voice_duplex::error::CaptureError;
use voice_duplex::network::{MemoryTransport, RemoteEnd};
use voice_duplex::protocol::{Channel, Envelope, MessageKind};
use voice_duplex::{ClientEvent, VoiceClient};

/// Microphone that replays fixed blocks or refuses access
#[derive(Default)]
struct ScriptedMicrophone {
    deny: bool,
    /// Rate the device reports; the requested rate when unset
    device_rate: Option<u32>,
    blocks: Mutex<Vec<Vec<f32>>>,
    requests: Mutex<Vec<CaptureRequest>>,
}

struct ScriptedStream {
    sample_rate: u32,
}

impl MicrophoneStream for ScriptedStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        1
    }

    fn stop(&mut self) {}
}

impl Microphone for ScriptedMicrophone {
    fn open(
        &self,
        request: &CaptureRequest,
        output: SharedRingBuffer,
    ) -> Result<Box<dyn MicrophoneStream>, CaptureError> {
        self.requests.lock().push(request.clone());
        if self.deny {
            return Err(CaptureError::PermissionDenied("denied by user".into()));
        }
        for (sequence, block) in self.blocks.lock().drain(..).enumerate() {
            output.push(AudioFrame::new(block, 1, 0, sequence as u32));
        }
        Ok(Box::new(ScriptedStream {
            sample_rate: self.device_rate.unwrap_or(request.sample_rate),
        }))
    }
}

struct Harness {
    client: Arc<VoiceClient>,
    microphone: Arc<ScriptedMicrophone>,
    listener: mpsc::UnboundedReceiver<RemoteEnd>,
}

/// Raw capture, so frames carry exactly the scripted samples
fn harness(microphone: ScriptedMicrophone) -> Harness {
    let mut config = AppConfig::default();
    config.capture.echo_cancellation = false;
    config.capture.noise_suppression = false;
    config.capture.auto_gain_control = false;
    harness_with(microphone, config)
}

fn harness_with(microphone: ScriptedMicrophone, config: AppConfig) -> Harness {
    let (transport, listener) = MemoryTransport::new();
    let microphone = Arc::new(microphone);
    let sink_factory: SinkFactory = Arc::new(|rate| {
        let sink: Arc<dyn AudioSink> = VirtualSink::realtime(rate);
        Ok(sink)
    });
    let client = VoiceClient::new(
        config,
        Arc::new(transport),
        microphone.clone(),
        sink_factory,
    )
    .unwrap();
    Harness {
        client,
        microphone,
        listener,
    }
}

async fn connect(harness: &mut Harness) -> RemoteEnd {
    let remote = async {
        let mut end = harness.listener.recv().await.unwrap();
        end.recv_envelope().await.unwrap();
        end.send_envelope(&Envelope::new(MessageKind::Init).with_session(Some("s-1".into())));
        end
    };
    let (result, end) = tokio::join!(harness.client.connect(), remote);
    assert_eq!(result.unwrap(), "s-1");
    end
}

fn output_audio(ms: u64) -> Envelope {
    let bytes = vec![0x10u8; (24 * ms * 2) as usize];
    let mut envelope = Envelope::new(MessageKind::OutputAudio)
        .with_channel(Channel::Index(0))
        .with_content("audio/pcm");
    envelope.file = Some(BASE64.encode(bytes));
    envelope
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>, wanted: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn first_sample(envelope: &Envelope) -> i16 {
    let bytes = BASE64.decode(envelope.audio_payload().unwrap()).unwrap();
    i16::from_le_bytes([bytes[0], bytes[1]])
}

#[tokio::test(start_paused = true)]
async fn test_microphone_requires_connection() {
    let harness = harness(ScriptedMicrophone::default());

    let err = harness.client.start_microphone().unwrap_err();
    assert_eq!(err, CaptureError::NotConnected);
    assert_eq!(err.user_message(), "cannot reach server");
    assert!(harness.microphone.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_sends_nothing() {
    let mut harness = harness(ScriptedMicrophone {
        deny: true,
        ..ScriptedMicrophone::default()
    });
    let mut end = connect(&mut harness).await;

    let err = harness.client.start_microphone().unwrap_err();
    assert!(matches!(err, CaptureError::PermissionDenied(_)));
    assert_eq!(err.user_message(), "microphone unavailable");
    assert!(!harness.client.is_recording());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(end.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_capture_frames_follow_barge_in() {
    let microphone = ScriptedMicrophone::default();
    microphone.blocks.lock().extend([vec![0.25; 1024], vec![0.5; 1024], vec![0.75; 100]]);
    let mut harness = harness(microphone);
    let mut end = connect(&mut harness).await;

    end.send_envelope(&output_audio(200));
    let scheduler = harness.client.scheduler().clone();
    until(|| scheduler.is_playing()).await;

    harness.client.start_microphone().unwrap();

    let cancel = end.recv_envelope().await.unwrap();
    assert_eq!(cancel.kind, MessageKind::CancelAudio);
    assert_eq!(cancel.channel, Some(Channel::Index(-1)));

    let first = end.recv_envelope().await.unwrap();
    let second = end.recv_envelope().await.unwrap();
    for frame in [&first, &second] {
        assert_eq!(frame.kind, MessageKind::InputAudio);
        assert_eq!(frame.channel, Some(Channel::Index(-1)));
        assert_eq!(frame.content.as_ref().and_then(|c| c.as_str()), Some("audio/pcm"));
        assert_eq!(frame.session_id.as_deref(), Some("s-1"));
        assert_eq!(BASE64.decode(frame.audio_payload().unwrap()).unwrap().len(), 2048);
    }
    assert_eq!(first_sample(&first), 8191);
    assert_eq!(first_sample(&second), 16383);
    assert!(!scheduler.is_playing());

    // The trailing partial frame stays buffered
    harness.client.stop_microphone();
    harness.client.stop_microphone();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(end.from_client.try_recv().is_err());
    assert_eq!(harness.microphone.requests.lock()[0].sample_rate, 16_000);
}

#[tokio::test(start_paused = true)]
async fn test_device_rate_is_converted_to_request_rate() {
    let microphone = ScriptedMicrophone {
        device_rate: Some(48_000),
        ..ScriptedMicrophone::default()
    };
    microphone.blocks.lock().extend([vec![0.5; 4096], vec![0.5; 4096], vec![0.5; 4096]]);
    let mut harness = harness(microphone);
    let mut end = connect(&mut harness).await;

    harness.client.start_microphone().unwrap();
    assert_eq!(harness.client.capture_processing(), None);

    // 12288 samples at 48 kHz are ~4096 at 16 kHz, well over two frames
    let first = end.recv_envelope().await.unwrap();
    let second = end.recv_envelope().await.unwrap();
    for frame in [&first, &second] {
        assert_eq!(frame.kind, MessageKind::InputAudio);
        assert_eq!(BASE64.decode(frame.audio_payload().unwrap()).unwrap().len(), 2048);
    }
    let settled = first_sample(&second) as i32;
    assert!((settled - 16383).abs() < 1640, "level drifted to {}", settled);
    assert_eq!(harness.microphone.requests.lock()[0].sample_rate, 16_000);
    harness.client.stop_microphone();
}

#[cfg(feature = "voice-processing")]
#[tokio::test(start_paused = true)]
#[serial_test::serial]
async fn test_processing_flags_reach_the_processor() {
    use voice_duplex::audio::ProcessingSettings;

    let microphone = ScriptedMicrophone::default();
    microphone.blocks.lock().extend([vec![0.25; 4096]]);
    let mut config = AppConfig::default();
    config.capture.echo_cancellation = false;
    let mut harness = harness_with(microphone, config);
    let mut end = connect(&mut harness).await;

    harness.client.start_microphone().unwrap();
    assert_eq!(
        harness.client.capture_processing(),
        Some(ProcessingSettings {
            echo_cancellation: false,
            noise_suppression: true,
            auto_gain_control: true,
        })
    );

    let frame = end.recv_envelope().await.unwrap();
    assert_eq!(frame.kind, MessageKind::InputAudio);
    assert_eq!(BASE64.decode(frame.audio_payload().unwrap()).unwrap().len(), 2048);

    harness.client.stop_microphone();
    assert_eq!(harness.client.capture_processing(), None);
}

#[cfg(not(feature = "voice-processing"))]
#[tokio::test(start_paused = true)]
async fn test_processing_falls_back_to_raw_capture() {
    let mut harness = harness_with(ScriptedMicrophone::default(), AppConfig::default());
    let _end = connect(&mut harness).await;

    harness.client.start_microphone().unwrap();
    assert!(harness.client.is_recording());
    assert_eq!(harness.client.capture_processing(), None);
}

#[tokio::test(start_paused = true)]
async fn test_playback_events_and_passthrough() {
    let mut harness = harness(ScriptedMicrophone::default());
    let mut events = harness.client.subscribe();
    let end = connect(&mut harness).await;

    end.send_envelope(&output_audio(200));
    next_event(&mut events, |e| *e == ClientEvent::Playing(true)).await;
    next_event(&mut events, |e| *e == ClientEvent::Playing(false)).await;

    end.send_text(r#"{"メッセージ識別":"output_text","メッセージ内容":"こんにちは"}"#);
    let event = next_event(&mut events, |e| matches!(e, ClientEvent::Message(_))).await;
    match event {
        ClientEvent::Message(envelope) => {
            assert_eq!(envelope.kind, MessageKind::Other("output_text".into()));
            assert_eq!(envelope.content.as_ref().and_then(|c| c.as_str()), Some("こんにちは"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_remote_cancel_is_not_echoed() {
    let mut harness = harness(ScriptedMicrophone::default());
    let mut end = connect(&mut harness).await;
    let scheduler = harness.client.scheduler().clone();

    end.send_envelope(&output_audio(500));
    until(|| scheduler.is_playing()).await;

    end.send_envelope(&Envelope::cancel_audio(Some("s-1".into())));
    until(|| !scheduler.is_playing()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(end.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_cancel_notifies_once() {
    let mut harness = harness(ScriptedMicrophone::default());
    let mut end = connect(&mut harness).await;
    let scheduler = harness.client.scheduler().clone();

    end.send_envelope(&output_audio(300));
    until(|| scheduler.is_playing()).await;

    assert!(harness.client.cancel());
    assert!(!harness.client.cancel());

    let notice = end.recv_envelope().await.unwrap();
    assert_eq!(notice.kind, MessageKind::CancelAudio);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(end.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_muted_output_still_drives_meter() {
    let mut harness = harness(ScriptedMicrophone::default());
    let end = connect(&mut harness).await;
    let scheduler = harness.client.scheduler().clone();

    harness.client.set_output_muted(true);
    end.send_envelope(&output_audio(500));
    until(|| scheduler.is_playing()).await;

    let sources = scheduler.active_sources();
    assert!(sources.iter().all(|s| !s.routing.speaker && s.routing.visualizer));

    let mut meter = harness.client.meter();
    tokio::time::timeout(
        Duration::from_secs(1),
        meter.wait_for(|snapshot| snapshot.output.iter().all(|&h| h >= 0.10)),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_provider_switch_rebuilds_pipeline() {
    let mut harness = harness(ScriptedMicrophone::default());
    let end = connect(&mut harness).await;
    let scheduler = harness.client.scheduler().clone();

    end.send_envelope(&output_audio(500));
    until(|| scheduler.is_playing()).await;

    harness.client.set_provider("openai").unwrap();
    assert!(!scheduler.is_playing());
    assert_eq!(harness.client.profile().input_sample_rate, 24_000);
    assert_eq!(scheduler.sink().sample_rate(), 24_000);

    harness.client.start_microphone().unwrap();
    assert_eq!(harness.microphone.requests.lock()[0].sample_rate, 24_000);
    harness.client.shutdown();
}
