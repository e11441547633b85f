use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the conversation a fragment transcribes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// What the microphone heard
    Input,
    /// What the model said
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// A streamed partial transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub direction: Direction,
    pub text: String,
}

impl TranscriptFragment {
    pub fn input(text: impl Into<String>) -> Self {
        Self {
            direction: Direction::Input,
            text: text.into(),
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self {
            direction: Direction::Output,
            text: text.into(),
        }
    }
}

/// One finalized utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub speaker: Speaker,

    /// Trimmed, never empty
    pub text: String,

    /// When the turn completed
    pub timestamp: DateTime<Utc>,
}

/// Rebuilds turn-delimited transcripts from streamed fragments
///
/// Fragments are appended in arrival order. Nothing is emitted until the
/// turn completes; then at most one record per speaker is added, user first.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    input: String,
    output: String,
    history: Vec<Transcript>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: TranscriptFragment) {
        match fragment.direction {
            Direction::Input => self.input.push_str(&fragment.text),
            Direction::Output => self.output.push_str(&fragment.text),
        }
    }

    /// Finalize the current turn. Returns the records it added to history.
    pub fn complete_turn(&mut self) -> &[Transcript] {
        let before = self.history.len();
        let timestamp = Utc::now();

        for (speaker, text) in [
            (Speaker::User, self.input.trim()),
            (Speaker::Assistant, self.output.trim()),
        ] {
            if !text.is_empty() {
                self.history.push(Transcript {
                    speaker,
                    text: text.to_string(),
                    timestamp,
                });
            }
        }

        self.input.clear();
        self.output.clear();

        &self.history[before..]
    }

    /// Text accumulated for the turn in progress
    pub fn pending(&self, direction: Direction) -> &str {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    pub fn history(&self) -> &[Transcript] {
        &self.history
    }

    /// Forget everything, including history
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.history.clear();
    }
}
