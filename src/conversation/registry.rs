//! # Conversation Registry
//!
//! Process-wide index of live conversations by conversation id.
//!
//! ## Thread Safety:
//! One `RwLock` around the map: lookups from REST handlers run concurrently, inserts and
//! removals (session initiate, end, expiry) take the write lock briefly. No lock is held
//! across an `.await`.
//!
//! ## Resource Management:
//! - Enforces the maximum number of concurrent conversations
//! - Removal is identity-checked so a stale timer of an old conversation can never
//!   evict a newer conversation that reuses the same id

use super::Conversation;
use crate::error::AppError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ConversationRegistry {
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
    max_conversations: usize,
}

impl ConversationRegistry {
    pub fn new(max_conversations: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_conversations,
        }
    }

    /// Register a conversation under its id.
    ///
    /// ## Returns:
    /// - **Ok(Some(previous))**: the id was taken; `previous` was replaced and should be ended
    /// - **Ok(None)**: fresh id
    /// - **Err(Conflict)**: the conversation has no id yet or capacity is reached
    pub fn insert(&self, conversation: Arc<Conversation>) -> Result<Option<Arc<Conversation>>, AppError> {
        let id = conversation
            .id()
            .ok_or_else(|| AppError::Conflict("conversation has no id".to_string()))?
            .to_string();

        let mut conversations = self.conversations.write();
        if !conversations.contains_key(&id) && conversations.len() >= self.max_conversations {
            return Err(AppError::Conflict(format!(
                "Maximum concurrent conversations ({}) reached",
                self.max_conversations
            )));
        }

        Ok(conversations.insert(id, conversation))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.conversations.read().get(id).cloned()
    }

    /// Remove `id` only if it still maps to `conversation`.
    pub fn remove_if_same(&self, id: &str, conversation: &Conversation) -> bool {
        let mut conversations = self.conversations.write();
        let same = conversations
            .get(id)
            .map(|entry| std::ptr::eq(Arc::as_ptr(entry), conversation))
            .unwrap_or(false);
        if same {
            conversations.remove(id);
        }
        same
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.conversations.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_conversations
    }
}
