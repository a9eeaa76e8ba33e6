//! # REST Conversation API
//!
//! Request/response flavour of the bot protocol. The platform creates a conversation,
//! posts activities and reads the bot's immediate replies from the response body.
//! Replies with a delay are pushed later over the optional websocket side channel
//! (`GET /conversation/{id}/websocket`).
//!
//! REST conversations share the registry and the expiry rules of websocket
//! conversations.

use crate::auth::Authorized;
use crate::bots::{build_handler, BotContext, BotSettings};
use crate::conversation::Conversation;
use crate::error::{AppError, AppResult};
use crate::protocol::Activity;
use crate::session::delivery::schedule_replies;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const TEST_HEADER: &str = "automation-test-header";
const CLOSE_CHANNEL_PREFIX: &str = "Close web socket";
const FAREWELL_TEXT: &str = "Closing websocket";

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    #[serde(default)]
    websocket: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    conversation: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    #[serde(rename = "activitiesURL")]
    activities_url: String,
    #[serde(rename = "refreshURL")]
    refresh_url: String,
    #[serde(rename = "disconnectURL")]
    disconnect_url: String,
    #[serde(rename = "websocketURL", skip_serializing_if = "Option::is_none")]
    websocket_url: Option<String>,
    expires_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct ActivitiesRequest {
    #[serde(default)]
    activities: Vec<Activity>,
}

fn lookup(state: &AppState, id: &str) -> AppResult<Arc<Conversation>> {
    state
        .registry
        .get(id)
        .ok_or_else(|| AppError::NotFound(format!("conversation {} not found", id)))
}

/// `GET /CreateConversation`: identifies the bot API to the platform.
pub async fn api_info(_auth: Authorized) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "type": "ac-bot-api",
        "success": true
    }))
}

/// `POST /CreateConversation`
pub async fn create_conversation(
    _auth: Authorized,
    state: web::Data<AppState>,
    query: web::Query<CreateQuery>,
    body: web::Json<CreateRequest>,
) -> AppResult<HttpResponse> {
    let id = body
        .into_inner()
        .conversation
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing conversation ID".to_string()))?;
    let with_websocket = query.websocket.as_deref() == Some("true");
    let config = state.get_config();

    let conversation = Conversation::new(state.registry.clone(), None);
    conversation.establish(&id, None, &config.audio.media_format)?;
    if with_websocket {
        conversation.enable_side_channel();
    }
    conversation.register(config.expiry())?;

    info!(conversation_id = %id, websocket = with_websocket, "New REST conversation");

    let response = CreateResponse {
        activities_url: format!("conversation/{}/activities", id),
        refresh_url: format!("conversation/{}/refresh", id),
        disconnect_url: format!("conversation/{}/disconnect", id),
        websocket_url: with_websocket.then(|| format!("conversation/{}/websocket", id)),
        expires_seconds: config.conversation.expiry_seconds,
    };
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /conversation/{id}/activities`
pub async fn post_activities(
    _auth: Authorized,
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ActivitiesRequest>,
) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    let conversation = lookup(&state, &id)?;
    let config = state.get_config();

    let mut activity = body
        .into_inner()
        .activities
        .into_iter()
        .next()
        .ok_or_else(|| AppError::BadRequest("No activities in request".to_string()))?;
    debug!(conversation_id = %id, activity = ?activity, "Received activity");

    if let Some(value) = req.headers().get(TEST_HEADER) {
        let value = value.to_str().unwrap_or_default();
        activity = Activity::message(format!("Received test header: {}", value));
    }

    if activity
        .text()
        .is_some_and(|text| text.starts_with(CLOSE_CHANNEL_PREFIX))
    {
        conversation.close_channel_after(Duration::from_millis(config.conversation.close_delay_ms));
    }

    let settings = BotSettings::from_config(&config);
    let handler = build_handler(config.bot.kind, &settings);
    let ctx = BotContext::new(conversation.clone(), Arc::new(settings));

    let replies = match AssertUnwindSafe(handler.on_activity(&ctx, &activity))
        .catch_unwind()
        .await
    {
        Ok(Ok(replies)) => replies,
        Ok(Err(err)) => {
            error!(conversation_id = %id, error = %err, "Bot handler failed");
            Vec::new()
        }
        Err(_) => {
            error!(conversation_id = %id, "Bot handler panicked");
            Vec::new()
        }
    };

    let immediate = schedule_replies(&conversation, replies);
    debug!(conversation_id = %id, count = immediate.len(), "Sending immediate replies");
    if immediate.is_empty() {
        Ok(HttpResponse::Ok().json(json!({})))
    } else {
        Ok(HttpResponse::Ok().json(json!({ "activities": immediate })))
    }
}

/// `POST /conversation/{id}/refresh`
pub async fn refresh(
    _auth: Authorized,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let conversation = lookup(&state, &path)?;
    let config = state.get_config();
    conversation.refresh_expiry(config.expiry());

    Ok(HttpResponse::Ok().json(json!({
        "expiresSeconds": config.conversation.expiry_seconds
    })))
}

/// `POST /conversation/{id}/disconnect`
pub async fn disconnect(
    _auth: Authorized,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let conversation = lookup(&state, &path)?;
    conversation
        .end_with_farewell(Activity::message(FAREWELL_TEXT))
        .await;
    info!(conversation_id = %path, "Conversation disconnected");

    Ok(HttpResponse::Ok().json(json!({})))
}
