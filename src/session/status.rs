use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::transcript::Transcript;

/// Externally observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    Error,
}

impl SessionStatus {
    /// Whether `start()` is accepted from this state
    pub fn can_start(self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Error)
    }

    /// Connecting or listening
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Listening)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Listening => "listening",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,

    pub status: SessionStatus,

    /// User-facing message for the last fatal error, cleared on start
    pub error: Option<String>,

    /// When the current session was started
    pub started_at: Option<DateTime<Utc>>,

    /// Finalized turns so far
    pub transcripts: Vec<Transcript>,

    /// Microphone frames handed to the transport
    pub frames_sent: u64,

    /// Microphone frames dropped because the transport was not open
    pub frames_dropped: u64,

    /// Reply chunks scheduled for playback
    pub chunks_played: u64,

    /// Reply chunks rejected by the decoder
    pub chunks_dropped: u64,

    /// Buffers currently scheduled or playing
    pub buffers_in_flight: usize,

    /// Where the next reply chunk will start on the output clock
    pub next_start_time: f64,
}
