use serde::{Deserialize, Serialize};

use crate::audio::{CaptureConstraints, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Gemilive, a friendly and helpful \
creation assistant for the TikFsceS app. Your name is Delia. Talk with the user naturally \
and give them advice on content creation. Keep it short and friendly.";

/// Configuration for a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unique session identifier (e.g., "live-3f0c...")
    pub session_id: String,

    /// Microphone rate the model expects (16kHz)
    pub capture_sample_rate: u32,

    /// Rate of the model's audio replies (24kHz)
    pub playback_sample_rate: u32,

    /// Samples per captured block
    /// Default: 4096 (~256ms at 16kHz)
    pub block_size: usize,

    /// NATS server URL
    pub nats_url: String,

    /// Live model name
    pub model: String,

    /// Persona given to the model at setup
    pub system_instruction: String,

    /// Prebuilt voice for replies
    pub voice: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("live-{}", uuid::Uuid::new_v4()),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            block_size: 4096,
            nats_url: "nats://localhost:4222".to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice: "Zephyr".to_string(),
        }
    }
}

impl SessionConfig {
    /// Capture is always mono; the live model rejects anything else.
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: self.capture_sample_rate,
            channels: 1,
            block_size: self.block_size,
        }
    }
}
