//! Voice Client Application
//!
//! Streams the default microphone to a voice service over a WebSocket and
//! plays the replies on the default output device.
//!
//! Usage: `voice-client [ws-url] [provider]`

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_duplex::{
    audio::{list_devices, AudioSink, CpalMicrophone, CpalSink},
    client::SinkFactory,
    config::AppConfig,
    network::WsTransport,
    ClientEvent, VoiceClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Voice Client");

    let mut config = AppConfig::load_or_default(None);
    if let Some(url) = std::env::args().nth(1) {
        config.server.url = url;
    }
    if let Some(provider) = std::env::args().nth(2) {
        config.provider = provider;
    }

    // List available devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let direction = if device.is_input { "Input" } else { "Output" };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, direction, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let output_device = config.playback.device_id.clone();
    let fft_size = config.meter.output_fft_size;
    let sink_factory: SinkFactory = Arc::new(move |rate| {
        let sink: Arc<dyn AudioSink> = CpalSink::open(output_device.as_deref(), rate, fft_size)?;
        Ok(sink)
    });

    let transport = Arc::new(WsTransport::new(config.server.url.clone()));
    let client = VoiceClient::new(config, transport, Arc::new(CpalMicrophone), sink_factory)?;
    let mut events = client.subscribe();

    match client.connect().await {
        Ok(session_id) => tracing::info!("Session {} established", session_id),
        Err(e) => {
            tracing::error!("cannot reach server: {}", e);
            client.shutdown();
            return Err(e.into());
        }
    }

    if let Err(e) = client.start_microphone() {
        tracing::error!("{}: {}", e.user_message(), e);
    }

    tracing::info!("Listening - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Message(envelope)) => {
                    if let Some(text) = envelope.content.as_ref().and_then(|c| c.as_str()) {
                        tracing::info!("[{}] {}", envelope.kind, text);
                    }
                }
                Ok(ClientEvent::ConnectionChanged(state)) => tracing::info!("Connection: {:?}", state),
                Ok(ClientEvent::Recording(recording)) => tracing::debug!("Recording: {}", recording),
                Ok(ClientEvent::Playing(playing)) => tracing::debug!("Playing: {}", playing),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("Skipped {} client events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown();
    tracing::info!("Stopped");
    Ok(())
}
