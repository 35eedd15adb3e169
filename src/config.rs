//! Runtime configuration
//!
//! Loaded from `config.toml` in the platform config directory. Missing
//! files, missing sections and missing keys all fall back to defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Sample-rate pair negotiated with a speech provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub name: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl ProviderProfile {
    /// `openai*` selects 24 kHz capture; everything else is the 16 kHz default
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        let input_sample_rate = if name.starts_with("openai") {
            24_000
        } else {
            DEFAULT_INPUT_SAMPLE_RATE
        };
        Self {
            name,
            input_sample_rate,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
        }
    }
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self::from_name("gemini")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    /// Session to resume on the first handshake
    pub session_id: Option<String>,
    pub slot: Option<i64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8095/ws".into(),
            session_id: None,
            slot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub handshake_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            delay_ms: RECONNECT_DELAY_MS,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// `input:<name>`; the host default when unset
    pub device_id: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_samples: CAPTURE_FRAME_SAMPLES,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub lookahead_ms: u64,
    pub start_muted: bool,
    /// `output:<name>`; the host default when unset
    pub device_id: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: DEFAULT_LOOKAHEAD_MS,
            start_muted: false,
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub bar_count: usize,
    pub interval_ms: u64,
    /// Lowest height of a bar fed by an active source
    pub active_floor: f32,
    /// Height of a reset bar
    pub idle_floor: f32,
    pub capture_fft_size: usize,
    pub output_fft_size: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            bar_count: METER_BAR_COUNT,
            interval_ms: METER_INTERVAL_MS,
            active_floor: 0.10,
            idle_floor: 0.02,
            capture_fft_size: CAPTURE_FFT_SIZE,
            output_fft_size: OUTPUT_FFT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: String,
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub meter: MeterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".into(),
            server: ServerConfig::default(),
            reconnect: ReconnectConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            meter: MeterConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn profile(&self) -> ProviderProfile {
        ProviderProfile::from_name(&self.provider)
    }

    /// `<config dir>/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "voice-duplex", "voice-duplex")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from `path` (or the default location), falling back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Self::default(),
        };
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("{}. Using default configuration.", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }
}
