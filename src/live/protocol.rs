//! Wire types of the Gemini Live (BidiGenerateContent) protocol

use crate::audio::codec::AudioChunk;
use serde::{Deserialize, Serialize};

/// Frames sent by the client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<TextContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    pub fn prebuilt(voice_name: &str) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextContent {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object requesting transcripts
#[derive(Debug, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: AudioChunk,
}

/// Frames received from the server. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Fragment of the caller's own speech
    pub fn input_text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .input_transcription
            .as_ref()?
            .text
            .as_deref()
    }

    /// Fragment of the coach's spoken feedback
    pub fn output_text(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .output_transcription
            .as_ref()?
            .text
            .as_deref()
    }

    /// Every inline audio payload in this message, in order
    pub fn audio_parts(&self) -> impl Iterator<Item = &InlineData> {
        self.server_content
            .iter()
            .filter_map(|c| c.model_turn.as_ref())
            .flat_map(|t| t.parts.iter())
            .filter_map(|p| p.inline_data.as_ref())
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content.as_ref().map(|c| c.turn_complete).unwrap_or(false)
    }

    /// The learner spoke over the coach; queued reply audio is stale
    pub fn interrupted(&self) -> bool {
        self.server_content.as_ref().map(|c| c.interrupted).unwrap_or(false)
    }
}

/// Everything a live session is configured with
#[derive(Debug, Clone)]
pub struct LiveSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub transcribe_input: bool,
    pub transcribe_output: bool,
}

impl LiveSetup {
    pub fn to_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };

        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: Some(SpeechConfig::prebuilt(&self.voice)),
            },
            system_instruction: Some(TextContent {
                parts: vec![TextPart {
                    text: self.system_instruction.clone(),
                }],
            }),
            input_audio_transcription: self.transcribe_input.then(TranscriptionConfig::default),
            output_audio_transcription: self.transcribe_output.then(TranscriptionConfig::default),
        })
    }
}
