//! # Conversation
//!
//! Session state bound to one connection and one externally assigned conversation id.
//!
//! ## Lifecycle:
//! ```text
//! Init --session.initiate / REST create--> Active --end / close / error--> Ended
//! ```
//! Transitions only move forward. Expiry is separate from the lifecycle: a conversation
//! whose expiry timer fires is dropped from the registry, but its connection is left
//! alone.
//!
//! ## Teardown:
//! [`Conversation::end`] may be reached from `session.end`, a transport close, a
//! transport error, a REST disconnect or a replaced registry entry, in any order and
//! concurrently. The first caller performs the teardown, every other call is a no-op.

pub mod registry;
pub mod timers;

use crate::audio::buffer::InboundAudioBuffer;
use crate::audio::stream::PlaybackControl;
use crate::error::{AppError, SendError};
use crate::protocol::{Activity, Alternative, OutboundEnvelope, OutboundMessage};
use crate::session::sink::MessageSink;
use parking_lot::{Mutex, RwLock};
use registry::ConversationRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use timers::{schedule_once, TimerHandle, TimerSlot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest outbound payload written to the debug log.
const LOG_PAYLOAD_LIMIT: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Init,
    Active,
    Ended,
}

/// Inbound audio sub-state of an active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    InboundStreaming,
}

#[derive(Debug)]
struct ConversationInner {
    state: ConversationState,
    stream_state: StreamState,
    media_format: String,
    caller: Option<String>,
    side_channel: bool,
}

pub struct Conversation {
    id: OnceLock<String>,
    inner: Mutex<ConversationInner>,
    inbound: InboundAudioBuffer,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    registry: Arc<ConversationRegistry>,
    expiry_timer: TimerSlot,
    flush_timer: TimerSlot,
    ended: CancellationToken,
    ending: AtomicBool,
    playback: PlaybackControl,
}

impl Conversation {
    pub fn new(registry: Arc<ConversationRegistry>, sink: Option<Arc<dyn MessageSink>>) -> Arc<Self> {
        Arc::new(Self {
            id: OnceLock::new(),
            inner: Mutex::new(ConversationInner {
                state: ConversationState::Init,
                stream_state: StreamState::Idle,
                media_format: String::new(),
                caller: None,
                side_channel: false,
            }),
            inbound: InboundAudioBuffer::new(),
            sink: RwLock::new(sink),
            registry,
            expiry_timer: TimerSlot::new(),
            flush_timer: TimerSlot::new(),
            ended: CancellationToken::new(),
            ending: AtomicBool::new(false),
            playback: PlaybackControl::new(),
        })
    }

    /// Fix the identity of the conversation and move it to `Active`.
    pub fn establish(&self, id: &str, caller: Option<String>, media_format: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock();
        if inner.state != ConversationState::Init {
            return Err(AppError::Conflict(format!(
                "conversation is already {:?}",
                inner.state
            )));
        }
        self.id
            .set(id.to_string())
            .map_err(|_| AppError::Conflict("conversation id already set".to_string()))?;

        inner.state = ConversationState::Active;
        inner.caller = caller;
        inner.media_format = media_format.to_string();
        Ok(())
    }

    /// Put the conversation into the registry and arm its expiry.
    ///
    /// A conversation already registered under the same id is ended.
    pub fn register(self: &Arc<Self>, expiry: Duration) -> Result<(), AppError> {
        if let Some(previous) = self.registry.insert(self.clone())? {
            if !Arc::ptr_eq(&previous, self) {
                warn!(conversation_id = previous.id().unwrap_or_default(), "Replacing registered conversation");
                previous.end();
            }
        }
        self.refresh_expiry(expiry);
        Ok(())
    }

    /// Cancel the pending expiry and schedule a new one `expiry` from now.
    pub fn refresh_expiry(self: &Arc<Self>, expiry: Duration) {
        if self.is_ended() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.expiry_timer.replace(schedule_once(expiry, async move {
            if let Some(conversation) = weak.upgrade() {
                conversation.expire();
            }
        }));
    }

    fn expire(&self) {
        self.expiry_timer.cancel();
        if let Some(id) = self.id() {
            if self.registry.remove_if_same(id, self) {
                warn!(conversation_id = id, "Conversation expired");
            }
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    pub fn state(&self) -> ConversationState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConversationState::Active
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Token cancelled when the conversation ends.
    pub fn ended_token(&self) -> CancellationToken {
        self.ended.clone()
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.lock().stream_state
    }

    pub fn set_stream_state(&self, stream_state: StreamState) {
        self.inner.lock().stream_state = stream_state;
    }

    pub fn media_format(&self) -> String {
        self.inner.lock().media_format.clone()
    }

    pub fn caller(&self) -> Option<String> {
        self.inner.lock().caller.clone()
    }

    #[cfg(test)]
    pub fn is_expiry_armed(&self) -> bool {
        self.expiry_timer.is_armed()
    }

    pub fn side_channel_enabled(&self) -> bool {
        self.inner.lock().side_channel
    }

    pub fn enable_side_channel(&self) {
        self.inner.lock().side_channel = true;
    }

    pub fn inbound(&self) -> &InboundAudioBuffer {
        &self.inbound
    }

    pub fn playback(&self) -> &PlaybackControl {
        &self.playback
    }

    /// Install the periodic inbound flush, replacing any previous one.
    pub fn arm_flush(&self, handle: TimerHandle) {
        if self.is_ended() {
            handle.cancel();
            return;
        }
        self.flush_timer.replace(handle);
    }

    /// Returns true when a flush timer was still pending.
    pub fn cancel_flush(&self) -> bool {
        self.flush_timer.cancel()
    }

    #[cfg(test)]
    pub fn is_flush_armed(&self) -> bool {
        self.flush_timer.is_armed()
    }

    #[cfg(test)]
    pub fn has_channel(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Attach the outbound channel. A channel attached after the end is closed at once.
    pub fn attach_sink(&self, sink: Arc<dyn MessageSink>) {
        if self.is_ended() {
            sink.close();
            return;
        }
        if let Some(previous) = self.sink.write().replace(sink) {
            previous.close();
        }
    }

    /// Close the outbound channel after `delay` without ending the conversation.
    pub fn close_channel_after(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        // Dropping the handle leaves the timer running
        let _ = schedule_once(delay, async move {
            if let Some(conversation) = weak.upgrade() {
                let sink = conversation.sink.write().take();
                if let Some(sink) = sink {
                    info!(conversation_id = conversation.id().unwrap_or_default(), "Closing message channel");
                    sink.close();
                }
            }
        });
    }

    /// Serialize `message` with a fresh id and timestamp and write it to the channel.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), SendError> {
        if self.is_ended() {
            return Err(SendError::ConnectionClosed);
        }
        let sink = self.sink.read().clone().ok_or(SendError::NoChannel)?;

        let frame = OutboundEnvelope::new(&message)
            .to_json()
            .map_err(|e| SendError::Serialize(e.to_string()))?;

        if !matches!(message, OutboundMessage::PlayStreamChunk { .. }) {
            debug!(
                conversation_id = self.id().unwrap_or_default(),
                message_type = message.message_type(),
                payload = truncate(&frame, LOG_PAYLOAD_LIMIT),
                "Sending message"
            );
        }
        sink.deliver(frame).await
    }

    /// Send all `activities` in one envelope, in order.
    pub async fn send_activities(&self, activities: Vec<Activity>) -> Result<(), SendError> {
        let activities = activities
            .into_iter()
            .map(|mut activity| {
                activity.delay = None;
                activity
            })
            .collect();
        self.send(OutboundMessage::Activities { activities }).await
    }

    pub async fn send_activity(&self, activity: Activity) -> Result<(), SendError> {
        self.send_activities(vec![activity]).await
    }

    /// Interim recognition result. The text is sent lowercased.
    pub async fn send_hypothesis(&self, text: &str) -> Result<(), SendError> {
        self.send(OutboundMessage::SpeechHypothesis {
            alternatives: vec![Alternative {
                text: text.to_lowercase(),
                confidence: None,
            }],
        })
        .await
    }

    /// Final recognition result, lowercased like hypotheses.
    pub async fn send_recognition(&self, text: &str, confidence: f64) -> Result<(), SendError> {
        self.send(OutboundMessage::SpeechRecognition {
            alternatives: vec![Alternative {
                text: text.to_lowercase(),
                confidence: Some(confidence),
            }],
        })
        .await
    }

    /// End the conversation. Returns true for the call that performed the teardown.
    pub fn end(&self) -> bool {
        if self.ending.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.teardown();
        true
    }

    /// Send `farewell` if the channel is still usable, then end.
    pub async fn end_with_farewell(&self, farewell: Activity) -> bool {
        if !self.is_ended() {
            if let Err(err) = self.send_activity(farewell).await {
                debug!(conversation_id = self.id().unwrap_or_default(), error = %err, "Farewell not delivered");
            }
        }
        self.end()
    }

    fn teardown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = ConversationState::Ended;
            inner.stream_state = StreamState::Idle;
        }
        self.ended.cancel();
        self.expiry_timer.cancel();
        self.flush_timer.cancel();
        self.playback.abort();
        self.inbound.clear();

        if let Some(id) = self.id() {
            self.registry.remove_if_same(id, self);
        }
        let sink = self.sink.write().take();
        if let Some(sink) = sink {
            sink.close();
        }
        info!(conversation_id = self.id().unwrap_or_default(), "Conversation ended");
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id())
            .field("inner", &*self.inner.lock())
            .field("ended", &self.is_ended())
            .finish()
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::sink::testing::RecordingSink;

    fn registered(registry: &Arc<ConversationRegistry>, id: &str) -> (Arc<Conversation>, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let conversation = Conversation::new(registry.clone(), Some(sink.clone()));
        conversation.establish(id, Some("+123".to_string()), "raw/lpcm16").unwrap();
        conversation.register(Duration::from_secs(60)).unwrap();
        (conversation, sink)
    }

    #[tokio::test]
    async fn test_establish_moves_to_active_once() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let conversation = Conversation::new(registry, None);
        assert_eq!(conversation.state(), ConversationState::Init);

        conversation.establish("c1", None, "raw/lpcm16").unwrap();
        assert!(conversation.is_active());
        assert_eq!(conversation.id(), Some("c1"));
        assert!(conversation.establish("c2", None, "raw/lpcm16").is_err());
        assert_eq!(conversation.id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, sink) = registered(&registry, "c1");

        assert!(conversation.end());
        assert!(!conversation.end());
        assert_eq!(sink.close_count(), 1);
        assert!(!registry.contains("c1"));
        assert_eq!(conversation.state(), ConversationState::Ended);
        assert!(!conversation.is_expiry_armed());
    }

    #[tokio::test]
    async fn test_send_after_end_fails_with_connection_closed() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, _sink) = registered(&registry, "c1");
        conversation.end();

        let err = conversation.send_activity(Activity::message("hi")).await.unwrap_err();
        assert_eq!(err, SendError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_send_without_channel() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let conversation = Conversation::new(registry, None);
        conversation.establish("c1", None, "raw/lpcm16").unwrap();

        let err = conversation.send(OutboundMessage::UserStreamStarted).await.unwrap_err();
        assert_eq!(err, SendError::NoChannel);
    }

    #[tokio::test]
    async fn test_envelope_has_id_and_timestamp() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, sink) = registered(&registry, "c1");

        conversation
            .send_activity(Activity::message("hello").with_delay(0))
            .await
            .unwrap();

        let frame = &sink.frames()[0];
        assert_eq!(frame["type"], "activities");
        assert!(frame["id"].is_string());
        assert!(frame["timestamp"].is_string());
        assert_eq!(frame["activities"][0]["text"], "hello");
        assert!(frame["activities"][0].get("delay").is_none());
    }

    #[tokio::test]
    async fn test_speech_helpers() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, sink) = registered(&registry, "c1");

        conversation.send_hypothesis("This Is A").await.unwrap();
        conversation.send_recognition("This is a Test", 0.8).await.unwrap();

        let frames = sink.frames();
        assert_eq!(frames[0]["type"], "userStream.speech.hypothesis");
        assert_eq!(frames[0]["alternatives"][0]["text"], "this is a");
        assert_eq!(frames[1]["type"], "userStream.speech.recognition");
        assert_eq!(frames[1]["alternatives"][0]["text"], "this is a test");
        assert_eq!(frames[1]["alternatives"][0]["confidence"], 0.8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshed_conversation_never_expires() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, _sink) = registered(&registry, "c1");

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(50)).await;
            conversation.refresh_expiry(Duration::from_secs(60));
        }
        assert!(registry.contains("c1"));
        assert!(conversation.is_expiry_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefreshed_conversation_expires_once() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, sink) = registered(&registry, "c1");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!registry.contains("c1"));
        assert!(!conversation.is_expiry_armed());
        // Expiry does not notify the peer
        assert!(sink.frames().is_empty());
        assert_eq!(sink.close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_keeps_newer_conversation() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (old, old_sink) = registered(&registry, "c1");
        tokio::time::sleep(Duration::from_secs(30)).await;

        let (new, _sink) = registered(&registry, "c1");
        assert!(old.is_ended());
        assert_eq!(old_sink.close_count(), 1);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(Arc::ptr_eq(&registry.get("c1").unwrap(), &new));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_channel_after_delay() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, sink) = registered(&registry, "c1");

        conversation.close_channel_after(Duration::from_millis(1000));
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(sink.close_count(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(sink.close_count(), 1);
        assert!(!conversation.has_channel());
        assert!(conversation.is_active());
    }

    #[tokio::test]
    async fn test_end_with_farewell_sends_before_closing() {
        let registry = Arc::new(ConversationRegistry::new(4));
        let (conversation, sink) = registered(&registry, "c1");

        assert!(conversation.end_with_farewell(Activity::message("Closing websocket")).await);
        assert_eq!(sink.frames_of("activities")[0]["activities"][0]["text"], "Closing websocket");
        assert_eq!(sink.close_count(), 1);
        assert!(!conversation.end_with_farewell(Activity::message("again")).await);
        assert_eq!(sink.frames().len(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 150), "short");
    }
}
