//! Scripted speech recognition.
//!
//! Stands in for a speech-to-text service: when the caller starts streaming, a fixed
//! timeline of hypotheses and a final recognition is played back, each step at its
//! offset from the start of the stream. Scripts may also place the speech started,
//! stopped and committed markers. Text messages are echoed.

use super::{BotContext, BotHandler};
use crate::config::{ScenarioStep, ScenarioStepKind};
use crate::protocol::{Activity, ActivityKind, OutboundMessage};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ScenarioBot {
    steps: Vec<ScenarioStep>,
}

impl ScenarioBot {
    pub fn new(steps: Vec<ScenarioStep>) -> Self {
        Self { steps }
    }
}

/// Play `steps` in order, sleeping the gap between consecutive offsets.
///
/// Returns the number of steps emitted. Stops without emitting the rest once the
/// conversation ends.
pub async fn run_scenario(ctx: &BotContext, steps: &[ScenarioStep]) -> usize {
    let mut last_offset = 0;
    let mut emitted = 0;
    for step in steps {
        let gap = step.offset_ms.saturating_sub(last_offset);
        if !ctx.sleep_unless_ended(Duration::from_millis(gap)).await {
            debug!(conversation_id = ctx.conversation_id(), emitted, "Scenario aborted");
            break;
        }

        let conversation = ctx.conversation();
        let sent = match step.kind {
            ScenarioStepKind::Hypothesis => ctx.send_hypothesis(&step.text).await,
            ScenarioStepKind::Recognition => ctx.send_recognition(&step.text, step.confidence).await,
            ScenarioStepKind::Started => conversation.send(OutboundMessage::SpeechStarted).await,
            ScenarioStepKind::Stopped => conversation.send(OutboundMessage::SpeechStopped).await,
            ScenarioStepKind::Committed => conversation.send(OutboundMessage::SpeechCommitted).await,
        };
        if let Err(err) = sent {
            warn!(conversation_id = ctx.conversation_id(), error = %err, "Scenario step not delivered");
            break;
        }
        emitted += 1;
        last_offset = step.offset_ms;
    }
    emitted
}

#[async_trait]
impl BotHandler for ScenarioBot {
    async fn on_activity(&self, ctx: &BotContext, activity: &Activity) -> anyhow::Result<Vec<Activity>> {
        match &activity.kind {
            ActivityKind::Message { text } => Ok(vec![Activity::message(text.clone())]),
            ActivityKind::Event { name } => {
                debug!(conversation_id = ctx.conversation_id(), event = %name, "Got event");
                Ok(Vec::new())
            }
        }
    }

    async fn on_user_stream_start(&self, ctx: &BotContext) -> anyhow::Result<()> {
        info!(conversation_id = ctx.conversation_id(), steps = self.steps.len(), "Starting scenario");
        let steps = self.steps.clone();
        let runner = ctx.clone();
        ctx.spawn(async move {
            run_scenario(&runner, &steps).await;
        });
        Ok(())
    }
}
