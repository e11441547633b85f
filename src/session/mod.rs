//! Live voice session
//!
//! `LiveSession` owns one duplex conversation with the live model:
//! - Microphone capture, encoded and streamed over the transport
//! - Gapless playback of streamed reply audio, with barge-in
//! - Turn-delimited transcripts for both speakers
//! - A status state machine (idle → connecting → listening, or error)

mod capture;
mod config;
mod controller;
mod scheduler;
mod status;
mod transcript;

pub use capture::{CapturePipeline, CaptureState};
pub use config::{SessionConfig, DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION};
pub use controller::{LiveSession, SessionDeps};
pub use scheduler::{PlaybackScheduler, ScheduledBuffer};
pub use status::{SessionSnapshot, SessionStatus};
pub use transcript::{Direction, Speaker, Transcript, TranscriptAssembler, TranscriptFragment};
