//! # Protocol Session
//!
//! The per-connection state machine of the bot protocol.
//!
//! ## Processing Model:
//! Frames are handled strictly one at a time: a frame, including all awaited bot work,
//! is finished before the next one is read. Nothing a frame contains can stop the loop.
//! Malformed frames and unknown types are logged and skipped, handler failures are
//! logged, and failed sends only fail the send.
//!
//! ## Transitions:
//! ```text
//! Init    session.initiate        -> Active   (session.accepted)
//! *       session.resume          -> same     (session.accepted | session.error)
//! Active  activities              -> Active   (bot replies)
//! Active  userStream.start        -> Active   InboundStreaming (userStream.started)
//! Active  userStream.stop         -> Active   Idle (userStream.stopped)
//! *       session.end             -> Ended
//! ```
//! Anything else arriving in `Init` is ignored.

use crate::bots::{BotContext, BotHandler, BotSettings};
use crate::conversation::{Conversation, ConversationState, StreamState};
use crate::error::ProtocolError;
use crate::protocol::{event_name, parse_inbound, Activity, InboundFrame, InboundMessage, OutboundMessage};
use crate::session::delivery::schedule_replies;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CONVERSATION_NOT_FOUND: &str = "conversation not found";

/// Connection-level inputs of a protocol session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Token the platform must present
    pub configured_token: String,
    /// Token presented on the handshake
    pub supplied_token: String,
    /// Format announced in `session.accepted`
    pub media_format: String,
    pub expiry: Duration,
}

pub struct ProtocolSession {
    conversation: Arc<Conversation>,
    handler: Arc<dyn BotHandler>,
    context: BotContext,
    settings: SessionSettings,
    finished: AtomicBool,
}

impl ProtocolSession {
    pub fn new(
        conversation: Arc<Conversation>,
        handler: Arc<dyn BotHandler>,
        bot_settings: Arc<BotSettings>,
        settings: SessionSettings,
    ) -> Self {
        let context = BotContext::new(conversation.clone(), bot_settings);
        Self {
            conversation,
            handler,
            context,
            settings,
            finished: AtomicBool::new(false),
        }
    }

    pub fn conversation(&self) -> &Arc<Conversation> {
        &self.conversation
    }

    /// Handle frames until the sender side goes away, then end the conversation.
    pub async fn run(self, mut frames: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = frames.recv().await {
            self.handle_frame(&frame).await;
            if self.conversation.is_ended() {
                break;
            }
        }
        self.finish().await;
    }

    /// End the conversation and notify the bot, once.
    pub async fn finish(&self) {
        self.conversation.end();
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.handler.on_end(&self.context).await;
        }
    }

    fn conversation_id(&self) -> &str {
        self.conversation.id().unwrap_or_default()
    }

    /// Handle one inbound text frame. Never fails.
    pub async fn handle_frame(&self, text: &str) {
        if self.conversation.is_ended() {
            debug!(conversation_id = self.conversation_id(), "Ignoring frame after end");
            return;
        }
        if self.conversation.is_active() {
            self.conversation.refresh_expiry(self.settings.expiry);
        }

        match parse_inbound(text) {
            Ok(InboundFrame::Message(message)) => {
                if message.message_type() != InboundMessage::USER_STREAM_CHUNK {
                    debug!(
                        conversation_id = self.conversation_id(),
                        message_type = message.message_type(),
                        "Received message"
                    );
                }
                self.handle_message(message).await;
            }
            Ok(InboundFrame::Unknown(message_type)) => {
                info!(conversation_id = self.conversation_id(), message_type = %message_type, "Ignoring unknown message type");
            }
            Err(ProtocolError::InvalidShape { message_type, reason })
                if message_type == InboundMessage::SESSION_INITIATE
                    && self.conversation.state() == ConversationState::Init =>
            {
                warn!(reason = %reason, "Refusing invalid session.initiate");
                let conversation_id = conversation_id_hint(text);
                self.send(OutboundMessage::SessionError { conversation_id, reason }).await;
            }
            Err(err) => {
                warn!(conversation_id = self.conversation_id(), error = %err, "Discarding malformed frame");
            }
        }
    }

    async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::SessionInitiate {
                conversation_id,
                caller,
                supported_media_formats,
                ..
            } => self.on_initiate(conversation_id, caller, supported_media_formats).await,
            InboundMessage::SessionResume { conversation_id } => self.on_resume(conversation_id).await,
            InboundMessage::SessionEnd { reason, .. } => {
                info!(
                    conversation_id = self.conversation_id(),
                    reason = reason.as_deref().unwrap_or("none"),
                    "Session ended by platform"
                );
                self.finish().await;
            }
            other if !self.conversation.is_active() => {
                warn!(message_type = other.message_type(), "Ignoring message before session.initiate");
            }
            InboundMessage::Activities { activities, .. } => self.on_activities(activities).await,
            InboundMessage::UserStreamStart { .. } => self.on_stream_start().await,
            InboundMessage::UserStreamChunk { audio_chunk, .. } => self.on_stream_chunk(&audio_chunk),
            InboundMessage::UserStreamStop { .. } => self.on_stream_stop().await,
        }
    }

    async fn on_initiate(&self, conversation_id: String, caller: Option<String>, supported: Vec<String>) {
        if self.conversation.state() != ConversationState::Init {
            warn!(conversation_id = self.conversation_id(), "Ignoring repeated session.initiate");
            return;
        }

        let media_format = self.settings.media_format.clone();
        if !supported.is_empty() && !supported.contains(&media_format) {
            warn!(conversation_id = %conversation_id, ?supported, media_format = %media_format, "Platform did not offer the configured media format");
        }

        if let Err(err) = self.conversation.establish(&conversation_id, caller.clone(), &media_format) {
            warn!(conversation_id = %conversation_id, error = %err, "Failed to establish session");
            return;
        }
        if let Err(err) = self.conversation.register(self.settings.expiry) {
            warn!(conversation_id = %conversation_id, error = %err, "Refusing session");
            self.send(OutboundMessage::SessionError {
                conversation_id,
                reason: err.to_string(),
            })
            .await;
            self.finish().await;
            return;
        }

        let success = self.settings.supplied_token == self.settings.configured_token;
        info!(conversation_id = %conversation_id, caller = caller.as_deref().unwrap_or("unknown"), success, "Session accepted");
        self.send(OutboundMessage::SessionAccepted {
            media_format: Some(media_format),
            success: Some(success),
        })
        .await;
    }

    async fn on_resume(&self, conversation_id: String) {
        if self.conversation.id() == Some(conversation_id.as_str()) {
            self.send(OutboundMessage::accepted_resume()).await;
        } else {
            warn!(conversation_id = %conversation_id, "Resume for unknown conversation");
            self.send(OutboundMessage::SessionError {
                conversation_id,
                reason: CONVERSATION_NOT_FOUND.to_string(),
            })
            .await;
        }
    }

    async fn on_activities(&self, activities: Vec<Activity>) {
        for activity in activities {
            if let Some(name) = activity.event_name().filter(|name| !event_name::is_known(name)) {
                debug!(conversation_id = self.conversation_id(), event = %name, "Event outside the platform catalog");
            }
            let replies = self
                .guarded("activity", self.handler.on_activity(&self.context, &activity))
                .await
                .unwrap_or_default();

            let immediate = schedule_replies(&self.conversation, replies);
            if !immediate.is_empty() {
                self.send(OutboundMessage::Activities { activities: immediate }).await;
            }
        }
    }

    async fn on_stream_start(&self) {
        self.conversation.inbound().clear();
        self.conversation.set_stream_state(StreamState::InboundStreaming);
        self.send(OutboundMessage::UserStreamStarted).await;
        self.guarded("user stream start", self.handler.on_user_stream_start(&self.context))
            .await;
    }

    fn on_stream_chunk(&self, audio_chunk: &str) {
        if self.conversation.stream_state() != StreamState::InboundStreaming {
            debug!(conversation_id = self.conversation_id(), "Dropping audio chunk outside a user stream");
            return;
        }
        match STANDARD.decode(audio_chunk) {
            Ok(audio) => self.conversation.inbound().append(&audio),
            Err(err) => warn!(
                conversation_id = self.conversation_id(),
                error = %ProtocolError::from(err),
                "Discarding audio chunk"
            ),
        }
    }

    async fn on_stream_stop(&self) {
        if self.conversation.stream_state() != StreamState::InboundStreaming {
            warn!(conversation_id = self.conversation_id(), "Ignoring userStream.stop without a user stream");
            return;
        }
        // Single flusher: the periodic flush is gone before the final take
        self.conversation.cancel_flush();
        self.conversation.set_stream_state(StreamState::Idle);

        let inbound = self.conversation.inbound();
        let buffered = inbound.duration(&self.conversation.media_format());
        let audio = inbound.take();
        debug!(
            conversation_id = self.conversation_id(),
            bytes = audio.len(),
            duration_ms = buffered.map(|d| d.as_millis() as u64),
            "User stream stopped"
        );
        self.guarded("user audio", self.handler.on_user_audio(&self.context, audio))
            .await;
        self.send(OutboundMessage::UserStreamStopped).await;
    }

    /// Run one handler call, logging its error or panic.
    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                error!(conversation_id = self.conversation_id(), operation, error = %err, "Bot handler failed");
                None
            }
            Err(_) => {
                error!(conversation_id = self.conversation_id(), operation, "Bot handler panicked");
                None
            }
        }
    }

    async fn send(&self, message: OutboundMessage) {
        let message_type = message.message_type();
        if let Err(err) = self.conversation.send(message).await {
            warn!(conversation_id = self.conversation_id(), message_type, error = %err, "Send failed");
        }
    }
}

/// Best-effort `conversationId` of a frame that failed to parse.
fn conversation_id_hint(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("conversationId")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::text_echo::TextEchoBot;
    use crate::bots::voice_echo::VoiceEchoBot;
    use crate::config::AppConfig;
    use crate::conversation::registry::ConversationRegistry;
    use crate::session::sink::testing::RecordingSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Bot that records audio and fails or panics on demand.
    #[derive(Default)]
    struct RecordingBot {
        audio: Mutex<Vec<Bytes>>,
        streams: Mutex<usize>,
        ends: Mutex<usize>,
    }

    #[async_trait]
    impl BotHandler for RecordingBot {
        async fn on_activity(&self, _ctx: &BotContext, activity: &Activity) -> anyhow::Result<Vec<Activity>> {
            match activity.text() {
                Some("fail") => Err(anyhow::anyhow!("bot failure")),
                Some("panic") => panic!("bot panic"),
                Some("delayed") => Ok(vec![
                    Activity::message("first").with_delay(100),
                    Activity::message("second").with_delay(200),
                ]),
                Some(text) => Ok(vec![Activity::message(format!("ok {text}"))]),
                None => Ok(Vec::new()),
            }
        }

        async fn on_user_stream_start(&self, _ctx: &BotContext) -> anyhow::Result<()> {
            *self.streams.lock() += 1;
            Ok(())
        }

        async fn on_user_audio(&self, _ctx: &BotContext, audio: Bytes) -> anyhow::Result<()> {
            self.audio.lock().push(audio);
            Ok(())
        }

        async fn on_end(&self, _ctx: &BotContext) {
            *self.ends.lock() += 1;
        }
    }

    struct Harness {
        session: ProtocolSession,
        sink: Arc<RecordingSink>,
        registry: Arc<ConversationRegistry>,
    }

    fn harness(handler: Arc<dyn BotHandler>, supplied_token: &str) -> Harness {
        harness_with(handler, supplied_token, BotSettings::from_config(&AppConfig::default()))
    }

    fn harness_with(handler: Arc<dyn BotHandler>, supplied_token: &str, bot_settings: BotSettings) -> Harness {
        let config = AppConfig::default();
        let registry = Arc::new(ConversationRegistry::new(4));
        let sink = RecordingSink::new();
        let conversation = Conversation::new(registry.clone(), Some(sink.clone()));
        let session = ProtocolSession::new(
            conversation,
            handler,
            Arc::new(bot_settings),
            SessionSettings {
                configured_token: config.auth.access_token.clone(),
                supplied_token: supplied_token.to_string(),
                media_format: config.audio.media_format.clone(),
                expiry: config.expiry(),
            },
        );
        Harness {
            session,
            sink,
            registry,
        }
    }

    impl Harness {
        async fn frame(&self, value: serde_json::Value) {
            self.session.handle_frame(&value.to_string()).await;
        }

        async fn initiate(&self) {
            self.frame(json!({"type": "session.initiate", "conversationId": "c1", "caller": "+123"}))
                .await;
        }

        fn state(&self) -> ConversationState {
            self.session.conversation().state()
        }
    }

    fn text_bot() -> Arc<dyn BotHandler> {
        Arc::new(TextEchoBot::new(AppConfig::default().bot.welcome_text))
    }

    #[tokio::test]
    async fn test_text_bot_conversation() {
        let h = harness(text_bot(), "TOKEN");

        h.initiate().await;
        assert_eq!(h.state(), ConversationState::Active);
        assert!(h.registry.contains("c1"));
        let accepted = h.sink.frames_of("session.accepted");
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0]["mediaFormat"], "raw/lpcm16");
        assert_eq!(accepted[0]["success"], true);

        h.frame(json!({"type": "activities", "conversationId": "c1", "activities": [{"type": "event", "name": "start"}]}))
            .await;
        let replies = h.sink.frames_of("activities");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["activities"][0]["type"], "message");
        assert_eq!(
            replies[0]["activities"][0]["text"],
            AppConfig::default().bot.welcome_text
        );

        h.frame(json!({"type": "activities", "conversationId": "c1", "activities": [{"type": "message", "text": "disconnect."}]}))
            .await;
        let replies = h.sink.frames_of("activities");
        assert_eq!(replies[1]["activities"][0]["type"], "event");
        assert_eq!(replies[1]["activities"][0]["name"], event_name::HANGUP);
    }

    #[tokio::test]
    async fn test_wrong_token_reports_failure() {
        let h = harness(text_bot(), "WRONG");
        h.initiate().await;

        assert_eq!(h.state(), ConversationState::Active);
        assert_eq!(h.sink.frames_of("session.accepted")[0]["success"], false);
    }

    #[tokio::test]
    async fn test_resume() {
        let h = harness(text_bot(), "TOKEN");
        h.initiate().await;
        h.sink.clear();

        h.frame(json!({"type": "session.resume", "conversationId": "c1"})).await;
        let frames = h.sink.frames();
        assert_eq!(frames[0]["type"], "session.accepted");
        assert!(frames[0].get("mediaFormat").is_none());
        assert!(frames[0].get("success").is_none());

        h.frame(json!({"type": "session.resume", "conversationId": "other"})).await;
        let error = &h.sink.frames_of("session.error")[0];
        assert_eq!(error["conversationId"], "other");
        assert_eq!(error["reason"], "conversation not found");
        assert_eq!(h.state(), ConversationState::Active);
    }

    #[tokio::test]
    async fn test_resume_before_initiate_is_not_found() {
        let h = harness(text_bot(), "TOKEN");
        h.frame(json!({"type": "session.resume", "conversationId": "c1"})).await;

        assert_eq!(h.sink.types(), vec!["session.error"]);
        assert_eq!(h.state(), ConversationState::Init);
    }

    #[tokio::test]
    async fn test_initiate_without_id_is_refused() {
        let h = harness(text_bot(), "TOKEN");
        h.frame(json!({"type": "session.initiate", "caller": "+123"})).await;

        assert_eq!(h.state(), ConversationState::Init);
        let error = &h.sink.frames_of("session.error")[0];
        assert!(error["reason"].as_str().unwrap().contains("conversationId"));
        assert!(h.registry.is_empty());

        // A later valid initiate still works
        h.initiate().await;
        assert_eq!(h.state(), ConversationState::Active);
    }

    #[tokio::test]
    async fn test_initiate_with_empty_id_is_refused() {
        let h = harness(text_bot(), "TOKEN");
        h.frame(json!({"type": "session.initiate", "conversationId": "", "caller": "+123"}))
            .await;

        assert_eq!(h.state(), ConversationState::Init);
        assert!(h.sink.frames_of("session.accepted").is_empty());
        let error = &h.sink.frames_of("session.error")[0];
        assert_eq!(error["conversationId"], "");
        assert!(error["reason"].as_str().unwrap().contains("conversationId"));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_initiate_is_ignored() {
        let h = harness(text_bot(), "TOKEN");
        h.initiate().await;
        h.frame(json!({"type": "session.initiate", "conversationId": "c2"})).await;

        assert_eq!(h.sink.frames_of("session.accepted").len(), 1);
        assert_eq!(h.session.conversation().id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_frames_are_skipped() {
        let h = harness(text_bot(), "TOKEN");
        h.initiate().await;
        h.sink.clear();

        h.session.handle_frame("not json").await;
        h.session.handle_frame("{\"no\": \"type\"}").await;
        h.frame(json!({"type": "activities", "activities": "not a list"})).await;
        h.frame(json!({"type": "session.telepathy", "conversationId": "c1"})).await;
        assert!(h.sink.frames().is_empty());
        assert_eq!(h.state(), ConversationState::Active);

        h.frame(json!({"type": "activities", "activities": [{"type": "message", "text": "still here"}]}))
            .await;
        assert_eq!(h.sink.frames_of("activities").len(), 1);
    }

    #[tokio::test]
    async fn test_messages_before_initiate_are_ignored() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot.clone(), "TOKEN");

        h.frame(json!({"type": "activities", "activities": [{"type": "message", "text": "hi"}]}))
            .await;
        h.frame(json!({"type": "userStream.start"})).await;
        assert!(h.sink.frames().is_empty());
        assert_eq!(*bot.streams.lock(), 0);
    }

    #[tokio::test]
    async fn test_user_stream_round_trip() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot.clone(), "TOKEN");
        h.initiate().await;
        h.sink.clear();

        h.frame(json!({"type": "userStream.start"})).await;
        h.frame(json!({"type": "userStream.chunk", "audioChunk": STANDARD.encode([1u8, 2, 3])}))
            .await;
        h.frame(json!({"type": "userStream.chunk", "audioChunk": "!!not base64!!"}))
            .await;
        h.frame(json!({"type": "userStream.chunk", "audioChunk": STANDARD.encode([4u8, 5])}))
            .await;
        h.frame(json!({"type": "userStream.stop"})).await;

        assert_eq!(h.sink.types(), vec!["userStream.started", "userStream.stopped"]);
        assert_eq!(*bot.streams.lock(), 1);
        let audio = bot.audio.lock();
        assert_eq!(audio.len(), 1);
        assert_eq!(&audio[0][..], &[1, 2, 3, 4, 5]);
        assert_eq!(h.session.conversation().stream_state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_stream_edge_cases() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot.clone(), "TOKEN");
        h.initiate().await;
        h.sink.clear();

        // Stop while idle and chunks outside a stream are ignored
        h.frame(json!({"type": "userStream.stop"})).await;
        h.frame(json!({"type": "userStream.chunk", "audioChunk": STANDARD.encode([9u8])}))
            .await;
        assert!(h.sink.frames().is_empty());
        assert!(bot.audio.lock().is_empty());

        // An empty stream hands over an empty buffer
        h.frame(json!({"type": "userStream.start"})).await;
        h.frame(json!({"type": "userStream.stop"})).await;
        assert!(bot.audio.lock()[0].is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_periodic_flush_before_final_take() {
        let bot_settings =
            BotSettings::from_config(&AppConfig::default()).with_echo_interval(Duration::from_millis(100));
        let h = harness_with(Arc::new(VoiceEchoBot::new()), "TOKEN", bot_settings);
        h.initiate().await;
        h.sink.clear();

        let chunk = |bytes: &[u8]| json!({"type": "userStream.chunk", "audioChunk": STANDARD.encode(bytes)});
        h.frame(json!({"type": "userStream.start"})).await;
        h.frame(chunk(&[1, 2])).await;
        h.frame(chunk(&[3])).await;

        // First periodic flush echoes what arrived so far
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.sink.frames_of("playStream.start").len(), 1);

        h.frame(chunk(&[4, 5])).await;
        h.frame(chunk(&[6])).await;
        h.frame(json!({"type": "userStream.stop"})).await;
        assert!(!h.session.conversation().is_flush_armed());
        assert_eq!(h.sink.frames_of("playStream.start").len(), 2);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(h.sink.frames_of("playStream.start").len(), 2);
        let types = h.sink.types();
        let stopped = types.iter().position(|t| t == "userStream.stopped").unwrap();
        assert!(types[stopped..].iter().all(|t| !t.starts_with("playStream")));

        let echoed: Vec<u8> = h
            .sink
            .frames_of("playStream.chunk")
            .iter()
            .flat_map(|frame| STANDARD.decode(frame["audioChunk"].as_str().unwrap()).unwrap())
            .collect();
        assert_eq!(echoed, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_stop_processing() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot, "TOKEN");
        h.initiate().await;
        h.sink.clear();

        h.frame(json!({"type": "activities", "activities": [
            {"type": "message", "text": "fail"},
            {"type": "message", "text": "panic"},
            {"type": "message", "text": "after"}
        ]}))
        .await;

        let replies = h.sink.frames_of("activities");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["activities"][0]["text"], "ok after");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_replies_are_pushed_separately() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot, "TOKEN");
        h.initiate().await;
        h.sink.clear();

        h.frame(json!({"type": "activities", "activities": [{"type": "message", "text": "delayed"}]}))
            .await;
        assert!(h.sink.frames().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let replies = h.sink.frames_of("activities");
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["activities"][0]["text"], "first");
        assert_eq!(replies[1]["activities"][0]["text"], "second");
    }

    #[tokio::test]
    async fn test_session_end_tears_down_once() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot.clone(), "TOKEN");
        h.initiate().await;

        h.frame(json!({"type": "session.end", "conversationId": "c1", "reason": "hangup"}))
            .await;
        assert_eq!(h.state(), ConversationState::Ended);
        assert!(!h.registry.contains("c1"));
        assert_eq!(h.sink.close_count(), 1);

        h.frame(json!({"type": "activities", "activities": [{"type": "message", "text": "late"}]}))
            .await;
        h.session.finish().await;
        assert_eq!(*bot.ends.lock(), 1);
        assert_eq!(h.sink.frames_of("activities").len(), 0);
    }

    #[tokio::test]
    async fn test_run_ends_conversation_when_channel_closes() {
        let bot = Arc::new(RecordingBot::default());
        let h = harness(bot.clone(), "TOKEN");
        let conversation = h.session.conversation().clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(json!({"type": "session.initiate", "conversationId": "c1"}).to_string())
            .unwrap();
        drop(tx);
        h.session.run(rx).await;

        assert_eq!(conversation.state(), ConversationState::Ended);
        assert!(!h.registry.contains("c1"));
        assert_eq!(*bot.ends.lock(), 1);
    }

    #[tokio::test]
    async fn test_capacity_refusal() {
        let h = harness(text_bot(), "TOKEN");
        for i in 0..4 {
            let other = Conversation::new(h.registry.clone(), None);
            other.establish(&format!("other-{i}"), None, "raw/lpcm16").unwrap();
            other.register(Duration::from_secs(60)).unwrap();
        }

        h.initiate().await;
        assert!(h.sink.frames_of("session.accepted").is_empty());
        assert_eq!(h.sink.frames_of("session.error").len(), 1);
        assert_eq!(h.state(), ConversationState::Ended);
    }

    #[test]
    fn test_conversation_id_hint() {
        assert_eq!(conversation_id_hint(r#"{"conversationId":"c9"}"#), "c9");
        assert_eq!(conversation_id_hint("nope"), "");
    }
}
