use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::audio::{AudioSource, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::session::{SessionConfig, DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION};

/// Prefix for environment overrides, e.g. `GEMILIVE__LIVE__NATS_URL`
pub const ENV_PREFIX: &str = "GEMILIVE";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "gemilive".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub block_size: usize,

    /// Named capture device; system default when unset
    pub input_device: Option<String>,

    /// Replay this WAV file instead of opening a microphone
    pub input_wav: Option<String>,

    /// Play replies on the default output device
    pub speakers: bool,

    /// Write the rendered reply audio to this WAV file on stop
    pub record_path: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            block_size: 4096,
            input_device: None,
            input_wav: None,
            speakers: false,
            record_path: None,
        }
    }
}

impl AudioConfig {
    pub fn source(&self) -> AudioSource {
        match &self.input_wav {
            Some(path) => AudioSource::File(expand_path(path)),
            None => AudioSource::Microphone {
                device: self.input_device.clone(),
            },
        }
    }

    pub fn record_path(&self) -> Option<PathBuf> {
        self.record_path.as_deref().map(expand_path)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub nats_url: String,
    pub model: String,
    pub system_instruction: String,
    pub voice: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice: "Zephyr".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (any format the `config` crate understands, extension
    /// optional) and apply `GEMILIVE__*` environment overrides. A missing
    /// file leaves the defaults in place.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capture_sample_rate: self.audio.capture_sample_rate,
            playback_sample_rate: self.audio.playback_sample_rate,
            block_size: self.audio.block_size,
            nats_url: self.live.nats_url.clone(),
            model: self.live.model.clone(),
            system_instruction: self.live.system_instruction.clone(),
            voice: self.live.voice.clone(),
            ..SessionConfig::default()
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.service.http.bind, self.service.http.port)
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}
