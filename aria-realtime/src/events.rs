//! Control-channel event codec.
//!
//! Inbound frames are JSON objects discriminated by `type`. They are decoded
//! into the wire-level [`ServerEvent`] and then classified into the smaller
//! [`InboundEvent`] set the session loop acts on. Both the beta
//! (`response.audio.*`) and GA (`response.output_audio.*`) event names are
//! accepted.
//!
//! Outbound traffic is limited to the three [`OutboundMessage`] shapes, each
//! encoded as one or more self-contained [`ClientEvent`] frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VoiceError};

// ── Client Events ───────────────────────────────────────────────────────

/// Events sent from the client to the realtime server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Add a user message or a function output to the conversation.
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// The conversation item.
        item: ConversationItem,
    },

    /// Ask the model to generate a response.
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Optional per-response overrides.
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },

    /// Cancel the in-flight response.
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// A conversation item for text turns or function outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item type: "message" or "function_call_output".
    #[serde(rename = "type")]
    pub item_type: String,
    /// Role for messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts for messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    /// Call being answered, for function outputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function output payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// A content part within a conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type, e.g. "input_text".
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ConversationItem {
    /// Create a user text message item.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                content_type: "input_text".to_string(),
                text: Some(text.into()),
            }]),
            call_id: None,
            output: None,
        }
    }

    /// Create a function output item.
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_type: "function_call_output".to_string(),
            role: None,
            content: None,
            call_id: Some(call_id.into()),
            output: Some(output.into()),
        }
    }
}

/// The messages this client ever writes to the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Inject a user text turn and request a response.
    UserText(String),
    /// Return a function result and request a response.
    FunctionResult {
        /// Call being answered.
        call_id: String,
        /// Result payload, passed through untouched.
        output: String,
    },
    /// Cancel the in-flight response.
    CancelResponse,
}

impl OutboundMessage {
    /// The wire events for this message, in write order.
    pub fn client_events(&self) -> Vec<ClientEvent> {
        match self {
            Self::UserText(text) => vec![
                ClientEvent::ConversationItemCreate { item: ConversationItem::user_text(text) },
                ClientEvent::ResponseCreate { response: None },
            ],
            Self::FunctionResult { call_id, output } => vec![
                ClientEvent::ConversationItemCreate {
                    item: ConversationItem::function_output(call_id, output),
                },
                ClientEvent::ResponseCreate { response: None },
            ],
            Self::CancelResponse => vec![ClientEvent::ResponseCancel],
        }
    }

    /// Serialize to JSON frames, in write order.
    pub fn encode(&self) -> Result<Vec<String>> {
        self.client_events()
            .iter()
            .map(|event| serde_json::to_string(event).map_err(VoiceError::from))
            .collect()
    }
}

// ── Server Events ───────────────────────────────────────────────────────

/// Events received from the realtime server.
///
/// Only the fields the agent uses are modelled; everything else in a frame
/// is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session was created.
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session details.
        #[serde(default)]
        session: Value,
    },

    /// Session configuration was updated.
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Updated session details.
        #[serde(default)]
        session: Value,
    },

    /// Error reported by the server.
    #[serde(rename = "error")]
    Error {
        /// Error details.
        #[serde(default)]
        error: ErrorInfo,
    },

    /// User speech started (server VAD).
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Audio start time in milliseconds.
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    /// User speech ended (server VAD).
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        /// Audio end time in milliseconds.
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    /// Transcript of the user's audio turn.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        /// Item the transcript belongs to.
        #[serde(default)]
        item_id: Option<String>,
        /// Full transcript.
        transcript: String,
    },

    /// Conversation item was created.
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        /// The created item.
        item: Value,
    },

    /// Response generation started.
    #[serde(rename = "response.created")]
    ResponseCreated {
        /// Response details.
        #[serde(default)]
        response: Value,
    },

    /// Response generation completed.
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Final response details.
        #[serde(default)]
        response: Value,
    },

    /// Response output item added.
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        /// The output item.
        item: Value,
    },

    /// Chunk of response audio. The audio itself travels on the media track.
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        /// Response ID.
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Assistant transcript delta.
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    TranscriptDelta {
        /// Transcript fragment.
        delta: String,
    },

    /// Assistant transcript completed.
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    TranscriptDone {
        /// Complete transcript.
        transcript: String,
    },

    /// Function call arguments delta.
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallDelta {
        /// Call ID.
        call_id: String,
        /// Arguments fragment.
        delta: String,
    },

    /// Function call arguments complete.
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        /// Call ID.
        call_id: String,
        /// Function name, when the server repeats it here.
        #[serde(default)]
        name: Option<String>,
        /// Complete arguments.
        #[serde(default)]
        arguments: Option<String>,
    },

    /// Any event type not listed above.
    #[serde(other)]
    Unknown,
}

/// Error information from the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error message.
    #[serde(default)]
    pub message: String,
}

/// What the session loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// `session.created` / `session.updated`.
    SessionLifecycle(String),
    /// User started speaking.
    SpeechStarted,
    /// User stopped speaking.
    SpeechStopped,
    /// Transcript of a user audio turn.
    UserTranscript(String),
    /// Response generation started.
    ResponseStarted,
    /// Assistant transcript fragment.
    AssistantTranscriptDelta(String),
    /// Final assistant transcript.
    AssistantTranscriptDone(String),
    /// Response audio is streaming.
    AudioStreaming,
    /// Response generation completed.
    ResponseCompleted,
    /// Fragment of a function call's arguments.
    FunctionArgumentsDelta {
        /// Call ID.
        call_id: String,
        /// Fragment.
        delta: String,
    },
    /// A function call item was announced.
    FunctionCallAdded {
        /// Call ID.
        call_id: String,
        /// Tool name.
        name: String,
    },
    /// A function call's arguments are complete.
    FunctionArgumentsDone {
        /// Call ID.
        call_id: String,
        /// Tool name, if present on this event.
        name: Option<String>,
        /// Arguments, if present on this event.
        arguments: Option<String>,
    },
    /// Server-reported error.
    ServerError {
        /// Error code (or type when no code was sent).
        code: String,
        /// Message.
        message: String,
    },
    /// Well-formed event with no effect on the agent.
    Ignored(String),
}

/// Decode one control-channel frame.
///
/// Returns [`VoiceError::Decode`] for frames that are not JSON objects with a
/// string `type`, or whose fields have the wrong shape.
pub fn decode(payload: &str) -> Result<InboundEvent> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| VoiceError::decode(format!("invalid JSON: {e}")))?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| VoiceError::decode("missing event type"))?
        .to_string();
    let event: ServerEvent = serde_json::from_value(value)
        .map_err(|e| VoiceError::decode(format!("malformed '{event_type}' event: {e}")))?;
    Ok(event.classify(event_type))
}

impl ServerEvent {
    fn classify(self, event_type: String) -> InboundEvent {
        match self {
            Self::SessionCreated { .. } | Self::SessionUpdated { .. } => {
                InboundEvent::SessionLifecycle(event_type)
            }
            Self::Error { error } => InboundEvent::ServerError {
                code: error.code.or(error.error_type).unwrap_or_default(),
                message: error.message,
            },
            Self::SpeechStarted { .. } => InboundEvent::SpeechStarted,
            Self::SpeechStopped { .. } => InboundEvent::SpeechStopped,
            Self::InputTranscriptionCompleted { transcript, .. } => {
                InboundEvent::UserTranscript(transcript)
            }
            Self::ResponseCreated { .. } => InboundEvent::ResponseStarted,
            Self::ResponseDone { .. } => InboundEvent::ResponseCompleted,
            Self::AudioDelta { .. } => InboundEvent::AudioStreaming,
            Self::TranscriptDelta { delta } => InboundEvent::AssistantTranscriptDelta(delta),
            Self::TranscriptDone { transcript } => InboundEvent::AssistantTranscriptDone(transcript),
            Self::FunctionCallDelta { call_id, delta } => {
                InboundEvent::FunctionArgumentsDelta { call_id, delta }
            }
            Self::FunctionCallDone { call_id, name, arguments } => {
                InboundEvent::FunctionArgumentsDone { call_id, name, arguments }
            }
            Self::OutputItemAdded { item } | Self::ItemCreated { item } => {
                function_call_item(&item)
                    .map(|(call_id, name)| InboundEvent::FunctionCallAdded { call_id, name })
                    .unwrap_or(InboundEvent::Ignored(event_type))
            }
            Self::Unknown => InboundEvent::Ignored(event_type),
        }
    }
}

fn function_call_item(item: &Value) -> Option<(String, String)> {
    if item.get("type").and_then(Value::as_str) != Some("function_call") {
        return None;
    }
    let call_id = item.get("call_id").and_then(Value::as_str)?;
    let name = item.get("name").and_then(Value::as_str)?;
    Some((call_id.to_string(), name.to_string()))
}
