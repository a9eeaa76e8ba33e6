//! # Protocol Messages
//!
//! Closed message catalog of the bot protocol. Every frame is a JSON object tagged by
//! its `type` field.
//!
//! ## Platform → bot
//! `session.initiate`, `session.resume`, `session.end`, `activities`,
//! `userStream.start`, `userStream.chunk`, `userStream.stop`
//!
//! ## Bot → platform
//! `session.accepted`, `session.error`, `activities`, `userStream.started`,
//! `userStream.stopped`, `userStream.speech.*`, `playStream.start`,
//! `playStream.chunk`, `playStream.stop`
//!
//! Unknown inbound types are not an error: [`parse_inbound`] reports them as
//! [`InboundFrame::Unknown`] so the engine can log and skip them.

use crate::error::ProtocolError;
use crate::protocol::activity::Activity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the platform sends to the bot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "session.initiate", rename_all = "camelCase")]
    SessionInitiate {
        conversation_id: String,
        #[serde(default)]
        caller: Option<String>,
        #[serde(default)]
        expect_audio_messages: Option<bool>,
        #[serde(default)]
        supported_media_formats: Vec<String>,
    },

    #[serde(rename = "session.resume", rename_all = "camelCase")]
    SessionResume { conversation_id: String },

    #[serde(rename = "session.end", rename_all = "camelCase")]
    SessionEnd {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "activities", rename_all = "camelCase")]
    Activities {
        #[serde(default)]
        conversation_id: Option<String>,
        activities: Vec<Activity>,
    },

    #[serde(rename = "userStream.start", rename_all = "camelCase")]
    UserStreamStart {
        #[serde(default)]
        conversation_id: Option<String>,
    },

    #[serde(rename = "userStream.chunk", rename_all = "camelCase")]
    UserStreamChunk {
        #[serde(default)]
        conversation_id: Option<String>,
        /// Base64 encoded audio
        audio_chunk: String,
    },

    #[serde(rename = "userStream.stop", rename_all = "camelCase")]
    UserStreamStop {
        #[serde(default)]
        conversation_id: Option<String>,
    },
}

impl InboundMessage {
    pub const SESSION_INITIATE: &'static str = "session.initiate";
    pub const USER_STREAM_CHUNK: &'static str = "userStream.chunk";

    /// Every `type` value this catalog knows how to parse.
    pub const KNOWN_TYPES: [&'static str; 7] = [
        "session.initiate",
        "session.resume",
        "session.end",
        "activities",
        "userStream.start",
        "userStream.chunk",
        "userStream.stop",
    ];

    pub fn message_type(&self) -> &'static str {
        match self {
            InboundMessage::SessionInitiate { .. } => "session.initiate",
            InboundMessage::SessionResume { .. } => "session.resume",
            InboundMessage::SessionEnd { .. } => "session.end",
            InboundMessage::Activities { .. } => "activities",
            InboundMessage::UserStreamStart { .. } => "userStream.start",
            InboundMessage::UserStreamChunk { .. } => "userStream.chunk",
            InboundMessage::UserStreamStop { .. } => "userStream.stop",
        }
    }
}

/// Result of parsing one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(InboundMessage),
    /// Well-formed JSON with a `type` this server does not implement
    Unknown(String),
}

/// Parse one text frame.
///
/// Parsing happens in two steps so an unknown `type` is distinguishable from a known
/// type with a broken shape: the former is forward-compatible traffic, the latter is a
/// malformed frame.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !InboundMessage::KNOWN_TYPES.contains(&message_type.as_str()) {
        return Ok(InboundFrame::Unknown(message_type));
    }

    let message: InboundMessage =
        serde_json::from_value(value).map_err(|err| ProtocolError::InvalidShape {
            message_type: message_type.clone(),
            reason: err.to_string(),
        })?;

    match &message {
        InboundMessage::SessionInitiate { conversation_id, .. } if conversation_id.trim().is_empty() => {
            Err(ProtocolError::InvalidShape {
                message_type,
                reason: "empty field `conversationId`".to_string(),
            })
        }
        _ => Ok(InboundFrame::Message(message)),
    }
}

/// One speech recognition alternative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Messages the bot sends to the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Answer to `session.initiate` (with payload) or a matching `session.resume`
    /// (without payload)
    #[serde(rename = "session.accepted", rename_all = "camelCase")]
    SessionAccepted {
        #[serde(skip_serializing_if = "Option::is_none")]
        media_format: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },

    #[serde(rename = "session.error", rename_all = "camelCase")]
    SessionError {
        conversation_id: String,
        reason: String,
    },

    #[serde(rename = "activities")]
    Activities { activities: Vec<Activity> },

    #[serde(rename = "userStream.started")]
    UserStreamStarted,

    #[serde(rename = "userStream.stopped")]
    UserStreamStopped,

    #[serde(rename = "userStream.speech.hypothesis")]
    SpeechHypothesis { alternatives: Vec<Alternative> },

    #[serde(rename = "userStream.speech.recognition")]
    SpeechRecognition { alternatives: Vec<Alternative> },

    #[serde(rename = "userStream.speech.started")]
    SpeechStarted,

    #[serde(rename = "userStream.speech.stopped")]
    SpeechStopped,

    #[serde(rename = "userStream.speech.committed")]
    SpeechCommitted,

    #[serde(rename = "playStream.start", rename_all = "camelCase")]
    PlayStreamStart {
        stream_id: String,
        media_format: String,
    },

    #[serde(rename = "playStream.chunk", rename_all = "camelCase")]
    PlayStreamChunk {
        stream_id: String,
        /// Base64 encoded audio
        audio_chunk: String,
    },

    #[serde(rename = "playStream.stop", rename_all = "camelCase")]
    PlayStreamStop { stream_id: String },
}

impl OutboundMessage {
    pub fn accepted_resume() -> Self {
        OutboundMessage::SessionAccepted {
            media_format: None,
            success: None,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            OutboundMessage::SessionAccepted { .. } => "session.accepted",
            OutboundMessage::SessionError { .. } => "session.error",
            OutboundMessage::Activities { .. } => "activities",
            OutboundMessage::UserStreamStarted => "userStream.started",
            OutboundMessage::UserStreamStopped => "userStream.stopped",
            OutboundMessage::SpeechHypothesis { .. } => "userStream.speech.hypothesis",
            OutboundMessage::SpeechRecognition { .. } => "userStream.speech.recognition",
            OutboundMessage::SpeechStarted => "userStream.speech.started",
            OutboundMessage::SpeechStopped => "userStream.speech.stopped",
            OutboundMessage::SpeechCommitted => "userStream.speech.committed",
            OutboundMessage::PlayStreamStart { .. } => "playStream.start",
            OutboundMessage::PlayStreamChunk { .. } => "playStream.chunk",
            OutboundMessage::PlayStreamStop { .. } => "playStream.stop",
        }
    }
}

/// Wire form of an outbound message: `{type, id, timestamp, ...fields}`.
///
/// `id` and `timestamp` are generated here, never by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope<'a> {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub message: &'a OutboundMessage,
}

impl<'a> OutboundEnvelope<'a> {
    pub fn new(message: &'a OutboundMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            message,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
