use serde::{Deserialize, Serialize};

use crate::audio::EncodedFrame;
use crate::transport::{LiveSetup, ServerMessage, TransportEvent};

/// Session setup request sent to the live bridge (request/reply)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub session_id: String,
    pub model: String,
    pub system_instruction: String,
    pub voice: String,
    pub response_modalities: Vec<String>,
    pub input_audio_transcription: bool,
    pub output_audio_transcription: bool,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl From<&LiveSetup> for SetupRequest {
    fn from(setup: &LiveSetup) -> Self {
        Self {
            session_id: setup.session_id.clone(),
            model: setup.model.clone(),
            system_instruction: setup.system_instruction.clone(),
            voice: setup.voice.clone(),
            response_modalities: vec!["AUDIO".to_string()],
            input_audio_transcription: true,
            output_audio_transcription: true,
            input_sample_rate: setup.input_sample_rate,
            output_sample_rate: setup.output_sample_rate,
        }
    }
}

/// Bridge acknowledgement of a setup request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupReply {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Microphone frame published to the bridge
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub session_id: String,
    pub sequence: u64,
    pub media: EncodedFrame,
    pub timestamp: String, // RFC3339 timestamp
}

/// Local hangup notice
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseNotice {
    pub session_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Message relayed from the live model
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessageWire {
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub error: Option<WireError>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<EncodedFrame>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoAway {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
}

impl ServerMessageWire {
    /// Map a relayed message onto a transport event
    ///
    /// Errors win over hangups, hangups over content. Content without any
    /// recognised field yields `None`.
    pub fn into_event(self) -> Option<TransportEvent> {
        if let Some(error) = self.error {
            return Some(TransportEvent::Error(error.message));
        }
        if let Some(go_away) = self.go_away {
            return Some(TransportEvent::Close(go_away.reason));
        }

        let content = self.server_content?;
        let audio = content
            .model_turn
            .and_then(|turn| turn.parts.into_iter().find_map(|part| part.inline_data))
            .map(|inline| inline.data);

        let message = ServerMessage {
            input_transcription: content.input_transcription.map(|t| t.text),
            output_transcription: content.output_transcription.map(|t| t.text),
            audio,
            turn_complete: content.turn_complete,
            interrupted: content.interrupted,
        };

        if message.is_empty() {
            None
        } else {
            Some(TransportEvent::Message(message))
        }
    }
}
