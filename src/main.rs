//! # Bot Session Server
//!
//! Conversational bot endpoint for a voice/telephony platform. The platform connects
//! over WebSocket (or the REST conversation API), exchanges text activities and streams
//! caller audio; the bot answers with activities, speech recognition results and
//! outbound audio streams.
//!
//! ## Modules:
//! - **protocol**: wire messages and activities
//! - **conversation**: per-conversation state, registry, expiry and timers
//! - **session**: the protocol state machine and reply delivery
//! - **audio**: inbound buffering and outbound chunked playback
//! - **bots**: pluggable bot behaviour (text echo, voice echo, scripted scenario)
//! - **websocket** / **handlers**: the actix-web transports
//! - **config**, **state**, **auth**, **health**, **error**: ambient plumbing

mod audio;
mod auth;
mod bots;
mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod protocol;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting bot-session-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        bot = ?config.bot.kind,
        media_format = %config.audio.media_format,
        expiry_seconds = config.conversation.expiry_seconds,
        "Configuration loaded"
    );

    let app_state = web::Data::new(AppState::new(config.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(websocket::bot_websocket))
            .route("/ws", web::get().to(websocket::bot_websocket))
            .route("/CreateConversation", web::get().to(handlers::api_info))
            .route("/CreateConversation", web::post().to(handlers::create_conversation))
            .service(
                web::scope("/conversation/{id}")
                    .route("/activities", web::post().to(handlers::post_activities))
                    .route("/refresh", web::post().to(handlers::refresh))
                    .route("/disconnect", web::post().to(handlers::disconnect))
                    .route("/websocket", web::get().to(websocket::conversation_websocket)),
            )
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = wait_for_shutdown() => {
            signal?;
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `bot_session_server=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bot_session_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
