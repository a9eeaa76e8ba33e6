//! Text echo bot.
//!
//! Greets on `start`, hangs up on `disconnect`, hands the call over on `transfer` and
//! echoes every other message back. Commands are matched case-insensitively with one
//! trailing period ignored, the way speech recognition tends to punctuate them.

use super::{BotContext, BotHandler};
use crate::protocol::{event_name, Activity, ActivityKind};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

pub struct TextEchoBot {
    welcome_text: String,
}

impl TextEchoBot {
    pub fn new(welcome_text: String) -> Self {
        Self { welcome_text }
    }
}

fn hangup() -> Activity {
    Activity::event(event_name::HANGUP).with_params(json!({
        "hangupReason": "Caller asked to disconnect"
    }))
}

fn transfer() -> Activity {
    Activity::event(event_name::TRANSFER).with_params(json!({
        "handoverReason": "Caller asked for a transfer",
        "transferTarget": "123456789",
        "transferReferredByURL": "sip:456@ac.com",
        "transferSipHeaders": [
            {"name": "UUID", "value": "123456789"},
            {"name": "Second-Header", "value": "Second-Header-Value"}
        ]
    }))
}

/// Echo `activity` back as a fresh reply. Parameters and a requested delay survive.
fn echo(activity: &Activity) -> Activity {
    let mut reply = activity.clone();
    reply.id = None;
    reply.timestamp = None;
    reply
}

#[async_trait]
impl BotHandler for TextEchoBot {
    async fn on_activity(&self, ctx: &BotContext, activity: &Activity) -> anyhow::Result<Vec<Activity>> {
        match &activity.kind {
            ActivityKind::Event { name } => {
                debug!(conversation_id = ctx.conversation_id(), event = %name, value = ?activity.value, "Got event");
                if activity.is_event(event_name::START) {
                    return Ok(vec![Activity::message(self.welcome_text.clone())]);
                }
                Ok(Vec::new())
            }
            ActivityKind::Message { text } => {
                info!(conversation_id = ctx.conversation_id(), text = %text, "Handling message");
                let reply = match activity.normalized_text().as_deref() {
                    Some("disconnect") => hangup(),
                    Some("transfer") => transfer(),
                    _ => echo(activity),
                };
                Ok(vec![reply])
            }
        }
    }
}
