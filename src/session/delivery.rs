//! Delivery of bot replies grouped by their requested delay.

use crate::conversation::timers::schedule_once;
use crate::conversation::Conversation;
use crate::protocol::Activity;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Split `replies` by `delay`.
///
/// Zero-delay replies are returned, stamped and in order, for the caller to answer
/// with. Every distinct non-zero delay gets its own timer that pushes that group as
/// one envelope over the conversation's channel once it elapses, stamped at that time.
pub fn schedule_replies(conversation: &Arc<Conversation>, replies: Vec<Activity>) -> Vec<Activity> {
    let mut groups: BTreeMap<u64, Vec<Activity>> = BTreeMap::new();
    for mut reply in replies {
        let delay = reply.delay_ms();
        reply.delay = None;
        groups.entry(delay).or_default().push(reply);
    }

    let immediate = groups
        .remove(&0)
        .unwrap_or_default()
        .into_iter()
        .map(Activity::stamped)
        .collect();

    for (delay, group) in groups {
        let weak = Arc::downgrade(conversation);
        debug!(
            conversation_id = conversation.id().unwrap_or_default(),
            delay_ms = delay,
            count = group.len(),
            "Scheduling delayed replies"
        );
        // Delayed groups are not cancelled on end; their send fails with connection closed
        let _ = schedule_once(Duration::from_millis(delay), async move {
            let Some(conversation) = weak.upgrade() else {
                return;
            };
            let group = group.into_iter().map(Activity::stamped).collect();
            if let Err(err) = conversation.send_activities(group).await {
                warn!(
                    conversation_id = conversation.id().unwrap_or_default(),
                    delay_ms = delay,
                    error = %err,
                    "Delayed replies not delivered"
                );
            }
        });
    }

    immediate
}
