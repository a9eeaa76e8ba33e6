//! # Bots
//!
//! Pluggable conversation logic. The protocol engine knows nothing about what a bot
//! does; it calls one [`BotHandler`] method per inbound event category and sends
//! whatever comes back.
//!
//! ## Implementations:
//! - **text_echo**: answers messages with text, handles `disconnect` and `transfer`
//! - **voice_echo**: plays a welcome prompt and echoes the caller's audio back
//! - **scenario**: replays a scripted timeline of speech recognition results
//!
//! ## Handler contract:
//! - Every method may fail; errors and panics are caught and logged by the engine
//! - Replies returned from [`BotHandler::on_activity`] may carry a `delay`; the engine
//!   delivers each distinct delay separately
//! - Long running work (playback, scripted timelines) should go through
//!   [`BotContext::spawn`] so it stops when the conversation ends

pub mod scenario;
pub mod text_echo;
pub mod voice_echo;

use crate::audio::silence;
use crate::audio::stream::{play_stream, PlaybackOutcome};
use crate::config::{AppConfig, BotKind, ScenarioStep};
use crate::conversation::timers::schedule_every;
use crate::conversation::Conversation;
use crate::error::{PlaybackError, SendError};
use crate::protocol::Activity;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Recognition text sent with every echoed audio stream.
pub const ECHO_RECOGNITION_TEXT: &str = "Echoing back incoming voice";
pub const ECHO_RECOGNITION_CONFIDENCE: f64 = 0.8;

/// Length of the generated prompt when no welcome prompt file is configured.
const GENERATED_PROMPT_LENGTH: Duration = Duration::from_secs(1);

#[async_trait]
pub trait BotHandler: Send + Sync {
    /// One inbound activity. The returned activities are the bot's replies.
    async fn on_activity(&self, ctx: &BotContext, activity: &Activity) -> anyhow::Result<Vec<Activity>>;

    /// The platform started streaming caller audio.
    async fn on_user_stream_start(&self, _ctx: &BotContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The caller audio collected up to `userStream.stop`. Empty when nothing arrived.
    async fn on_user_audio(&self, _ctx: &BotContext, _audio: Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    /// The conversation ended. Called once.
    async fn on_end(&self, _ctx: &BotContext) {}
}

/// Bot-facing settings, resolved from [`AppConfig`] once per connection.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub media_format: String,
    pub chunk_size: usize,
    pub echo_interval: Duration,
    pub welcome_prompt: Option<PathBuf>,
    pub welcome_text: String,
    pub scenario: Vec<ScenarioStep>,
}

impl BotSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let prompt = config.audio.welcome_prompt_path.trim();
        Self {
            media_format: config.audio.media_format.clone(),
            chunk_size: config.audio.chunk_size_bytes,
            echo_interval: Duration::from_millis(config.audio.echo_interval_ms),
            welcome_prompt: (!prompt.is_empty()).then(|| PathBuf::from(prompt)),
            welcome_text: config.bot.welcome_text.clone(),
            scenario: config.bot.scenario.clone(),
        }
    }

    pub fn with_echo_interval(mut self, echo_interval: Duration) -> Self {
        self.echo_interval = echo_interval;
        self
    }
}

/// Create the handler for `kind`.
pub fn build_handler(kind: BotKind, settings: &BotSettings) -> Arc<dyn BotHandler> {
    match kind {
        BotKind::TextEcho => Arc::new(text_echo::TextEchoBot::new(settings.welcome_text.clone())),
        BotKind::VoiceEcho => Arc::new(voice_echo::VoiceEchoBot::new()),
        BotKind::Scenario => Arc::new(scenario::ScenarioBot::new(settings.scenario.clone())),
    }
}

/// What a bot can do to its conversation.
#[derive(Clone)]
pub struct BotContext {
    conversation: Arc<Conversation>,
    settings: Arc<BotSettings>,
}

impl BotContext {
    pub fn new(conversation: Arc<Conversation>, settings: Arc<BotSettings>) -> Self {
        Self {
            conversation,
            settings,
        }
    }

    pub fn conversation(&self) -> &Arc<Conversation> {
        &self.conversation
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation.id().unwrap_or_default()
    }

    pub fn caller(&self) -> String {
        self.conversation.caller().unwrap_or_else(|| "unknown".to_string())
    }

    /// Media format of this conversation's audio.
    pub fn media_format(&self) -> String {
        let negotiated = self.conversation.media_format();
        if negotiated.is_empty() {
            self.settings.media_format.clone()
        } else {
            negotiated
        }
    }

    pub async fn send_hypothesis(&self, text: &str) -> Result<(), SendError> {
        self.conversation.send_hypothesis(text).await
    }

    pub async fn send_recognition(&self, text: &str, confidence: f64) -> Result<(), SendError> {
        self.conversation.send_recognition(text, confidence).await
    }

    /// Play `audio` as one outbound stream in the conversation's format.
    pub async fn play_audio(&self, audio: Bytes) -> Result<PlaybackOutcome, PlaybackError> {
        play_stream(
            &self.conversation,
            &audio[..],
            &self.media_format(),
            self.settings.chunk_size,
        )
        .await
    }

    /// The configured welcome prompt, or generated silence.
    pub async fn welcome_prompt(&self) -> Bytes {
        if let Some(path) = &self.settings.welcome_prompt {
            match tokio::fs::read(path).await {
                Ok(prompt) => return Bytes::from(prompt),
                Err(err) => warn!(
                    conversation_id = self.conversation_id(),
                    path = %path.display(),
                    error = %err,
                    "Failed to read welcome prompt, using silence"
                ),
            }
        }
        silence(&self.media_format(), GENERATED_PROMPT_LENGTH)
    }

    /// Sleep for `duration`. Returns false when the conversation ended first.
    pub async fn sleep_unless_ended(&self, duration: Duration) -> bool {
        let ended = self.conversation.ended_token();
        tokio::select! {
            _ = ended.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.conversation.is_ended(),
        }
    }

    /// Run `work` in the background until it finishes or the conversation ends.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ended = self.conversation.ended_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = ended.cancelled() => {}
                _ = work => {}
            }
        });
    }

    /// Echo the inbound buffer back every `echo_interval` while the caller streams.
    ///
    /// Replaces a running flush. `userStream.stop` cancels it before the final flush,
    /// and every flush takes the buffer atomically, so no byte is echoed twice.
    pub fn start_echo_flush(&self) {
        let ctx = self.clone();
        let period = self.settings.echo_interval;
        debug!(conversation_id = self.conversation_id(), ?period, "Arming echo flush");
        self.conversation.arm_flush(schedule_every(period, move || {
            let ctx = ctx.clone();
            async move { ctx.flush_echo() }
        }));
    }

    fn flush_echo(&self) {
        let audio = self.conversation.inbound().take();
        if audio.is_empty() {
            warn!(conversation_id = self.conversation_id(), "No incoming audio to send back");
            return;
        }
        info!(conversation_id = self.conversation_id(), bytes = audio.len(), "Sending back incoming voice");
        // Playback outlives the tick so cancelling the flush never cuts a stream short
        let ctx = self.clone();
        self.spawn(async move {
            if let Err(err) = ctx.echo_back(audio).await {
                warn!(conversation_id = ctx.conversation_id(), error = %err, "Echo playback failed");
            }
        });
    }

    /// Announce and play back caller audio.
    pub async fn echo_back(&self, audio: Bytes) -> anyhow::Result<PlaybackOutcome> {
        self.send_recognition(ECHO_RECOGNITION_TEXT, ECHO_RECOGNITION_CONFIDENCE)
            .await?;
        Ok(self.play_audio(audio).await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::conversation::registry::ConversationRegistry;
    use crate::session::sink::testing::RecordingSink;

    pub fn settings() -> BotSettings {
        BotSettings::from_config(&AppConfig::default())
    }

    /// Active conversation wired to a recording sink.
    pub fn context(settings: BotSettings) -> (BotContext, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let registry = Arc::new(ConversationRegistry::new(8));
        let conversation = Conversation::new(registry, Some(sink.clone()));
        conversation
            .establish("c1", Some("+123".to_string()), &settings.media_format)
            .unwrap();
        (BotContext::new(conversation, Arc::new(settings)), sink)
    }
}
