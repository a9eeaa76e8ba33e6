//! # Configuration Management
//!
//! Loads the server configuration from multiple sources:
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables `HOST`, `PORT`, `ACCESS_TOKEN`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUTH__ACCESS_TOKEN`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the `Default` impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration, grouped by concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub conversation: ConversationConfig,
    pub audio: AudioConfig,
    pub bot: BotConfig,
}

/// Listener settings and websocket keep-alive.
///
/// The keep-alive ping is a transport concern and runs on a much shorter period than
/// conversation expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between server pings on every websocket
    pub keepalive_interval_secs: u64,
    /// A socket silent for longer than this is closed
    pub client_timeout_secs: u64,
}

/// Bearer token settings shared by the websocket handshake and the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub access_token: String,
    /// Reject websocket upgrades with a wrong token before any protocol traffic.
    /// When disabled the socket is accepted and `session.accepted.success` is false.
    pub enforce_handshake: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Conversation expiry, reset by every refresh
    pub expiry_seconds: u64,
    pub max_concurrent_conversations: usize,
    /// Delay before a side channel is closed, so the farewell message gets flushed
    pub close_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Media format announced in `session.accepted` and `playStream.start`
    pub media_format: String,
    /// Size of every `playStream.chunk` payload before base64 encoding
    pub chunk_size_bytes: usize,
    /// Period of the inbound echo flush
    pub echo_interval_ms: u64,
    /// Raw prompt played by the voice bot on `start`; empty means generated silence
    pub welcome_prompt_path: String,
}

/// Which bot answers the conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotKind {
    TextEcho,
    VoiceEcho,
    Scenario,
}

impl std::str::FromStr for BotKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text-echo" | "text" => Ok(BotKind::TextEcho),
            "voice-echo" | "voice" => Ok(BotKind::VoiceEcho),
            "scenario" => Ok(BotKind::Scenario),
            other => Err(anyhow::anyhow!("Unknown bot kind: {}", other)),
        }
    }
}

/// One scripted recognition result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Offset from the start of playback, in milliseconds
    pub offset_ms: u64,
    pub kind: ScenarioStepKind,
    /// Recognized text; unused by the speech markers
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStepKind {
    Hypothesis,
    Recognition,
    /// `userStream.speech.started` marker
    Started,
    /// `userStream.speech.stopped` marker
    Stopped,
    /// `userStream.speech.committed` marker
    Committed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub kind: BotKind,
    pub welcome_text: String,
    pub scenario: Vec<ScenarioStep>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8081,
                keepalive_interval_secs: 10,
                client_timeout_secs: 30,
            },
            auth: AuthConfig {
                access_token: "TOKEN".to_string(),
                enforce_handshake: true,
            },
            conversation: ConversationConfig {
                expiry_seconds: 60,
                max_concurrent_conversations: 100,
                close_delay_ms: 1000,
            },
            audio: AudioConfig {
                media_format: "raw/lpcm16".to_string(),
                // 200ms of 16kHz 16-bit mono
                chunk_size_bytes: 6400,
                echo_interval_ms: 5000,
                welcome_prompt_path: String::new(),
            },
            bot: BotConfig {
                kind: BotKind::TextEcho,
                welcome_text: "Welcome to the websocket bot! How can I assist you today?".to_string(),
                scenario: default_scenario(),
            },
        }
    }
}

/// The scripted recognition sequence used by the scenario bot when none is configured.
pub fn default_scenario() -> Vec<ScenarioStep> {
    vec![
        ScenarioStep {
            offset_ms: 3000,
            kind: ScenarioStepKind::Hypothesis,
            text: "This is a".to_string(),
            confidence: 0.0,
        },
        ScenarioStep {
            offset_ms: 4000,
            kind: ScenarioStepKind::Hypothesis,
            text: "This is a test".to_string(),
            confidence: 0.0,
        },
        ScenarioStep {
            offset_ms: 5350,
            kind: ScenarioStepKind::Recognition,
            text: "This is a test message".to_string(),
            confidence: 0.96887113,
        },
    ]
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: override server port
    /// - `APP_CONVERSATION__EXPIRY_SECONDS=120`: longer conversation expiry
    /// - `ACCESS_TOKEN=secret`: bearer token expected from the platform
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(token) = env::var("ACCESS_TOKEN") {
            settings = settings.set_override("auth.access_token", token)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.keepalive_interval_secs == 0
            || self.server.client_timeout_secs <= self.server.keepalive_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero keep-alive interval"
            ));
        }

        if self.auth.access_token.is_empty() {
            return Err(anyhow::anyhow!("Access token cannot be empty"));
        }

        if self.conversation.expiry_seconds == 0 {
            return Err(anyhow::anyhow!("Conversation expiry must be greater than 0"));
        }

        if self.conversation.max_concurrent_conversations == 0 {
            return Err(anyhow::anyhow!("Max concurrent conversations must be greater than 0"));
        }

        if self.audio.chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!("Audio chunk size must be greater than 0"));
        }

        if self.audio.echo_interval_ms == 0 {
            return Err(anyhow::anyhow!("Echo interval must be greater than 0"));
        }

        if self
            .bot
            .scenario
            .windows(2)
            .any(|pair| pair[1].offset_ms < pair[0].offset_ms)
        {
            return Err(anyhow::anyhow!("Scenario offsets must not decrease"));
        }

        Ok(())
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.conversation.expiry_seconds)
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only settings that are read per conversation are updatable at runtime; listener
    /// and auth settings require a restart.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(conversation) = partial_config.get("conversation") {
            if let Some(expiry) = conversation.get("expiry_seconds").and_then(|v| v.as_u64()) {
                self.conversation.expiry_seconds = expiry;
            }
            if let Some(delay) = conversation.get("close_delay_ms").and_then(|v| v.as_u64()) {
                self.conversation.close_delay_ms = delay;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(size) = audio.get("chunk_size_bytes").and_then(|v| v.as_u64()) {
                self.audio.chunk_size_bytes = size as usize;
            }
            if let Some(interval) = audio.get("echo_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.echo_interval_ms = interval;
            }
        }

        if let Some(bot) = partial_config.get("bot") {
            if let Some(kind) = bot.get("kind").and_then(|v| v.as_str()) {
                self.bot.kind = kind.parse()?;
            }
            if let Some(text) = bot.get("welcome_text").and_then(|v| v.as_str()) {
                self.bot.welcome_text = text.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }
}
