//! # Application State
//!
//! Shared state handed to every HTTP handler and websocket endpoint through
//! `web::Data<AppState>`.
//!
//! ## Sharing Pattern:
//! - **config**: `Arc<RwLock<AppConfig>>`, read on every new connection and replaced
//!   by `PUT /api/v1/config`. Readers clone it out so the lock is never held for long.
//! - **registry**: the process-wide conversation registry, internally synchronized
//! - **start_time**: immutable, used for uptime reporting

use crate::config::AppConfig;
use crate::conversation::registry::ConversationRegistry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Live conversations of every transport
    pub registry: Arc<ConversationRegistry>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(ConversationRegistry::new(
            config.conversation.max_concurrent_conversations,
        ));
        Self {
            config: Arc::new(RwLock::new(config)),
            registry,
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Apply a partial JSON update. The stored configuration only changes when the
    /// updated configuration validates.
    pub fn update_config_from_json(&self, json: &str) -> anyhow::Result<AppConfig> {
        let mut config = self.config.write();
        let mut updated = config.clone();
        updated.update_from_json(json)?;
        *config = updated.clone();
        Ok(updated)
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let state = AppState::new(AppConfig::default());
        assert!(state
            .update_config_from_json(r#"{"audio": {"chunk_size_bytes": 0}}"#)
            .is_err());
        assert_eq!(state.get_config().audio.chunk_size_bytes, 6400);

        let updated = state
            .update_config_from_json(r#"{"audio": {"chunk_size_bytes": 3200}}"#)
            .unwrap();
        assert_eq!(updated.audio.chunk_size_bytes, 3200);
        assert_eq!(state.get_config().audio.chunk_size_bytes, 3200);
    }

    #[test]
    fn test_registry_capacity_follows_config() {
        let mut config = AppConfig::default();
        config.conversation.max_concurrent_conversations = 7;
        let state = AppState::new(config);
        assert_eq!(state.registry.capacity(), 7);
        assert!(state.registry.is_empty());
    }
}
