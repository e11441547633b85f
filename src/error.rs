//! Error taxonomy for live voice sessions.
//!
//! Device, output and connection failures are fatal to a session and always arrive
//! after the session has released its resources. Decode failures only ever
//! cost the offending audio chunk.

use crate::session::SessionStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    #[error("Microphone unavailable: {message}")]
    Device { message: String },

    #[error("Audio output unavailable: {message}")]
    Output { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Malformed audio payload: {message}")]
    Decode { message: String },

    #[error("Cannot {action} while session is {status}")]
    InvalidState {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("Session controller has shut down")]
    Closed,
}

impl LiveError {
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    pub fn output(message: impl Into<String>) -> Self {
        Self::Output {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Short text suitable for showing next to the start button.
    pub fn user_message(&self) -> String {
        match self {
            Self::Device { .. } => "Could not access the microphone. Check permissions.".to_string(),
            Self::Output { .. } => "Could not open the audio output.".to_string(),
            Self::Connection { .. } => "A connection error occurred.".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this error ends the session (as opposed to costing one chunk).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Device { .. } | Self::Output { .. } | Self::Connection { .. }
        )
    }
}

pub type LiveResult<T> = std::result::Result<T, LiveError>;
