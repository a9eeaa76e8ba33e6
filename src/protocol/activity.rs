//! Activities: the structured units exchanged inside an `activities` envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known event names understood by the platform.
pub mod event_name {
    pub const HANGUP: &str = "hangup";
    pub const TRANSFER: &str = "transfer";
    /// Synonym of `transfer`, kept for older platform versions
    pub const HANDOVER: &str = "handover";
    pub const CONFIG: &str = "config";
    pub const PLAY_URL: &str = "playUrl";
    pub const START: &str = "start";
    pub const PLAY_DATA: &str = "playData";
    pub const START_RECOGNITION: &str = "startRecognition";
    pub const STOP_RECOGNITION: &str = "stopRecognition";
    pub const SEND_META_DATA: &str = "sendMetaData";
    pub const START_CALL_RECORDING: &str = "startCallRecording";
    pub const STOP_CALL_RECORDING: &str = "stopCallRecording";
    pub const PAUSE_CALL_RECORDING: &str = "pauseCallRecording";
    pub const RESUME_CALL_RECORDING: &str = "resumeCallRecording";
    pub const SPEAKER_VERIFICATION_CREATE_SPEAKER: &str = "speakerVerificationCreateSpeaker";
    pub const SPEAKER_VERIFICATION_GET_SPEAKER_STATUS: &str = "speakerVerificationGetSpeakerStatus";
    pub const SPEAKER_VERIFICATION_DELETE_SPEAKER: &str = "speakerVerificationDeleteSpeaker";
    pub const SPEAKER_VERIFICATION_ENROLL: &str = "speakerVerificationEnroll";
    pub const SPEAKER_VERIFICATION_VERIFY: &str = "speakerVerificationVerify";
    pub const ABORT_PROMPTS: &str = "abortPrompts";
    pub const EXPECT_ANOTHER_BOT_MESSAGE: &str = "expectAnotherBotMessage";
    pub const SEND_DTMF: &str = "sendDtmf";

    const KNOWN: [&str; 22] = [
        HANGUP,
        TRANSFER,
        HANDOVER,
        CONFIG,
        PLAY_URL,
        START,
        PLAY_DATA,
        START_RECOGNITION,
        STOP_RECOGNITION,
        SEND_META_DATA,
        START_CALL_RECORDING,
        STOP_CALL_RECORDING,
        PAUSE_CALL_RECORDING,
        RESUME_CALL_RECORDING,
        SPEAKER_VERIFICATION_CREATE_SPEAKER,
        SPEAKER_VERIFICATION_GET_SPEAKER_STATUS,
        SPEAKER_VERIFICATION_DELETE_SPEAKER,
        SPEAKER_VERIFICATION_ENROLL,
        SPEAKER_VERIFICATION_VERIFY,
        ABORT_PROMPTS,
        EXPECT_ANOTHER_BOT_MESSAGE,
        SEND_DTMF,
    ];

    /// True for event names in the platform's catalog.
    pub fn is_known(name: &str) -> bool {
        KNOWN.contains(&name)
    }
}

/// What an activity carries: free text or a named event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActivityKind {
    Message { text: String },
    Event { name: String },
}

/// One activity with its optional parameters.
///
/// `delay` is only meaningful for replies: it asks the delivery layer to push the
/// activity that many milliseconds later instead of answering immediately. It is never
/// sent to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(flatten)]
    pub kind: ActivityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl Activity {
    fn with_kind(kind: ActivityKind) -> Self {
        Self {
            kind,
            id: None,
            timestamp: None,
            activity_params: None,
            session_params: None,
            parameters: None,
            value: None,
            delay: None,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::with_kind(ActivityKind::Message { text: text.into() })
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::with_kind(ActivityKind::Event { name: name.into() })
    }

    /// Attach `activityParams`. Non-object values are ignored.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.activity_params = Some(map);
        }
        self
    }

    #[cfg(test)]
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Give the activity a fresh id and timestamp, replacing any previous ones.
    pub fn stamped(mut self) -> Self {
        self.id = Some(uuid::Uuid::new_v4().to_string());
        self.timestamp = Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
        self
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            ActivityKind::Message { text } => Some(text),
            ActivityKind::Event { .. } => None,
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        match &self.kind {
            ActivityKind::Event { name } => Some(name),
            ActivityKind::Message { .. } => None,
        }
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.event_name() == Some(name)
    }

    /// Message text lowercased with one trailing period removed, the form bot commands
    /// are matched in (`"Disconnect."` -> `"disconnect"`).
    pub fn normalized_text(&self) -> Option<String> {
        self.text().map(|text| {
            let lowered = text.trim().to_lowercase();
            match lowered.strip_suffix('.') {
                Some(stripped) => stripped.to_string(),
                None => lowered,
            }
        })
    }

    /// Delay requested for this reply, zero when absent.
    pub fn delay_ms(&self) -> u64 {
        self.delay.unwrap_or(0)
    }
}
