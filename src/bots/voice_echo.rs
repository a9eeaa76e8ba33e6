//! # Voice Echo Bot
//!
//! Plays the caller's own voice back to them.
//!
//! ## Behaviour:
//! - `start` event: announces itself with a recognition result and plays the welcome
//!   prompt
//! - `userStream.start`: arms the periodic flush, which echoes caller audio back every
//!   echo interval until the stream stops
//! - `userStream.stop`: echoes whatever the last flush left behind
//! - text messages: answered with a `playUrl` event carrying silence, so the platform
//!   speaks the alt text `<caller>: <text>`

use super::{BotContext, BotHandler};
use crate::audio::silence;
use crate::protocol::{event_name, Activity, ActivityKind};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const WELCOME_RECOGNITION: &str = "Hi, I am the voice echo bot. You can talk and I will echo it back.";

/// Audio attached to `playUrl` replies.
const PLAY_URL_SILENCE: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct VoiceEchoBot;

impl VoiceEchoBot {
    pub fn new() -> Self {
        Self
    }

    fn play_url(ctx: &BotContext, text: &str) -> Activity {
        let media_format = ctx.media_format();
        let audio = silence(&media_format, PLAY_URL_SILENCE);
        Activity::event(event_name::PLAY_URL).with_params(json!({
            "playUrlAltText": format!("{}: {}", ctx.caller(), text),
            "playUrlUrl": format!("data:application/octet-stream;base64,{}", STANDARD.encode(&audio)),
            "playUrlMediaFormat": media_format,
        }))
    }
}

#[async_trait]
impl BotHandler for VoiceEchoBot {
    async fn on_activity(&self, ctx: &BotContext, activity: &Activity) -> anyhow::Result<Vec<Activity>> {
        match &activity.kind {
            ActivityKind::Event { name } if name == event_name::START => {
                let ctx = ctx.clone();
                ctx.clone().spawn(async move {
                    if let Err(err) = ctx.send_recognition(WELCOME_RECOGNITION, 0.8).await {
                        warn!(conversation_id = ctx.conversation_id(), error = %err, "Failed to announce welcome");
                        return;
                    }
                    let prompt = ctx.welcome_prompt().await;
                    match ctx.play_audio(prompt).await {
                        Ok(outcome) => {
                            debug!(conversation_id = ctx.conversation_id(), ?outcome, "Welcome prompt played")
                        }
                        Err(err) => warn!(conversation_id = ctx.conversation_id(), error = %err, "Welcome prompt failed"),
                    }
                });
                Ok(Vec::new())
            }
            ActivityKind::Event { name } => {
                debug!(conversation_id = ctx.conversation_id(), event = %name, "Got event");
                Ok(Vec::new())
            }
            ActivityKind::Message { text } => {
                info!(conversation_id = ctx.conversation_id(), text = %text, "Handling message");
                Ok(vec![Self::play_url(ctx, text)])
            }
        }
    }

    async fn on_user_stream_start(&self, ctx: &BotContext) -> anyhow::Result<()> {
        ctx.start_echo_flush();
        Ok(())
    }

    async fn on_user_audio(&self, ctx: &BotContext, audio: Bytes) -> anyhow::Result<()> {
        if audio.is_empty() {
            warn!(conversation_id = ctx.conversation_id(), "No audio received");
            return Ok(());
        }
        info!(conversation_id = ctx.conversation_id(), bytes = audio.len(), "Sending back incoming voice");
        ctx.echo_back(audio).await?;
        Ok(())
    }

    async fn on_end(&self, ctx: &BotContext) {
        ctx.conversation().cancel_flush();
    }
}
