//! Wire protocol for the realtime speech session.
//!
//! Message kinds follow the realtime speech API: outbound
//! `session.update`, `input_audio_buffer.append`/`commit`,
//! `conversation.item.create`, `response.create`; inbound session
//! lifecycle, transcript deltas, audio deltas, and errors. Unknown inbound
//! kinds are tolerated and ignored.

use serde::{Deserialize, Serialize};

use crate::config::{SessionConfig, TurnDetectionConfig};

/// Events sent to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure turn detection, formats, and transcription.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdateParams },

    /// Append a base64 audio chunk to the model's input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    /// Force end-of-utterance even absent detected silence. Recovery and
    /// diagnostics only; turn detection handles normal operation.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Inject a text item (diagnostic).
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Ask the model to respond to injected items.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

/// Body of `session.update`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdateParams {
    pub modalities: Vec<String>,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionParams>,
    pub turn_detection: TurnDetectionParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionParams {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetectionParams {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl From<&TurnDetectionConfig> for TurnDetectionParams {
    fn from(config: &TurnDetectionConfig) -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: config.threshold,
            prefix_padding_ms: config.prefix_padding_ms,
            silence_duration_ms: config.silence_duration_ms,
        }
    }
}

impl SessionUpdateParams {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            modalities: vec!["audio".to_string(), "text".to_string()],
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: config.input_audio_format.clone(),
            output_audio_format: config.output_audio_format.clone(),
            input_audio_transcription: config
                .transcription_model
                .as_ref()
                .map(|model| TranscriptionParams {
                    model: model.clone(),
                }),
            turn_detection: TurnDetectionParams::from(&config.turn_detection),
        }
    }
}

/// A conversation item for diagnostic text injection.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

impl ConversationItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                part_type: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

/// Events received from the model. Fields we do not consume are left to
/// serde's default handling so protocol additions never break parsing.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Option<serde_json::Value>,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<serde_json::Value>,
    },

    /// Base64 model audio.
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone {},

    /// Incremental transcript of model speech.
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },

    /// Completed transcription of caller speech.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {},

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Any message kind this relay does not consume.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_serializes_with_wire_tag() {
        let event = ClientEvent::InputAudioBufferAppend {
            audio: "AAAA".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["audio"], "AAAA");
    }

    #[test]
    fn session_update_carries_turn_detection() {
        let config = SessionConfig::default();
        let event = ClientEvent::SessionUpdate {
            session: SessionUpdateParams::from_config(&config),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(
            json["session"]["turn_detection"]["silence_duration_ms"],
            600
        );
        assert_eq!(json["session"]["input_audio_format"], "g711_ulaw");
    }

    #[test]
    fn parses_audio_delta() {
        let raw = r#"{"type":"response.audio.delta","response_id":"r1","delta":"c29tZQ=="}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            event,
            ServerEvent::ResponseAudioDelta { delta } if delta == "c29tZQ=="
        ));
    }

    #[test]
    fn unknown_event_kinds_are_tolerated() {
        let raw = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }

    #[test]
    fn parses_error_event() {
        let raw = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::Error { error } => assert_eq!(error.message, "bad"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
