//! # WebSocket Transport
//!
//! Binds the bot protocol to actix websocket actors.
//!
//! ## Bot socket (`GET /`, `GET /ws`):
//! 1. **Handshake**: the bearer token is checked before the upgrade; a wrong token is
//!    answered with 401 and no socket is opened
//! 2. **Session**: every socket gets one [`ProtocolSession`] running on its own task;
//!    text frames are forwarded to it in arrival order
//! 3. **Outbound**: the session writes through a [`WsSink`], which queues frames on the
//!    actor's mailbox, so the actor stays the only writer of the socket
//! 4. **Teardown**: close frames, protocol errors and heartbeat timeouts stop the actor,
//!    and a stopped actor ends its conversation
//!
//! ## Side channel (`GET /conversation/{id}/websocket`):
//! Push-only socket used by REST conversations for delayed replies.
//!
//! ## Query Parameters:
//! - `echoTime`: echo flush interval in milliseconds (voice echo bot)
//! - `bot`: `text-echo`, `voice-echo` or `scenario`, overriding the configured bot

use crate::auth::{authorize, supplied_token, HandshakeRequest};
use crate::bots::{build_handler, BotSettings};
use crate::config::BotKind;
use crate::conversation::Conversation;
use crate::error::{AppError, SendError};
use crate::session::{MessageSink, ProtocolSession, SessionSettings};
use crate::state::AppState;

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Queue one text frame on the socket.
#[derive(Message)]
#[rtype(result = "Result<(), SendError>")]
pub struct Deliver(pub String);

/// Close the socket after the frames already queued.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseConnection;

/// [`MessageSink`] writing to a websocket actor.
pub struct WsSink {
    deliver: Recipient<Deliver>,
    close: Recipient<CloseConnection>,
}

impl WsSink {
    pub fn new<A>(addr: Addr<A>) -> Self
    where
        A: Actor<Context = ws::WebsocketContext<A>> + Handler<Deliver> + Handler<CloseConnection>,
    {
        Self {
            deliver: addr.clone().recipient(),
            close: addr.recipient(),
        }
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn deliver(&self, frame: String) -> Result<(), SendError> {
        self.deliver
            .send(Deliver(frame))
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?
    }

    fn close(&self) {
        self.close.do_send(CloseConnection);
    }
}

/// Keep-alive settings shared by both socket kinds.
#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

impl Heartbeat {
    /// Ping every `interval`; stop the actor when the peer stayed silent past `timeout`.
    fn start<A>(self, ctx: &mut ws::WebsocketContext<A>)
    where
        A: Actor<Context = ws::WebsocketContext<A>> + HasHeartbeat,
    {
        ctx.run_interval(self.interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat()) > self.timeout {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

trait HasHeartbeat {
    fn last_heartbeat(&self) -> Instant;
}

/// Largest text message accepted as a sequence of continuation frames.
const MAX_FRAGMENTED_MESSAGE: usize = 16 * 1024 * 1024;

/// A fragmented message being reassembled.
#[derive(Debug)]
enum Fragments {
    Text(BytesMut),
    /// Binary messages are not part of the protocol; their fragments are dropped
    Binary,
}

impl Fragments {
    /// Feed one continuation item. Returns the complete text once the last fragment
    /// of a text message arrives.
    fn push(slot: &mut Option<Fragments>, item: Item) -> Result<Option<String>, String> {
        match item {
            Item::FirstText(data) => {
                if slot.is_some() {
                    return Err("new fragmented message before the previous one finished".to_string());
                }
                *slot = Some(Fragments::Text(BytesMut::from(&data[..])));
                Ok(None)
            }
            Item::FirstBinary(_) => {
                if slot.is_some() {
                    return Err("new fragmented message before the previous one finished".to_string());
                }
                *slot = Some(Fragments::Binary);
                Ok(None)
            }
            Item::Continue(data) => match slot.as_mut() {
                Some(Fragments::Text(buffer)) => {
                    if buffer.len() + data.len() > MAX_FRAGMENTED_MESSAGE {
                        *slot = None;
                        return Err("fragmented message too large".to_string());
                    }
                    buffer.extend_from_slice(&data);
                    Ok(None)
                }
                Some(Fragments::Binary) => Ok(None),
                None => Err("continuation without a first fragment".to_string()),
            },
            Item::Last(data) => match slot.take() {
                Some(Fragments::Text(mut buffer)) => {
                    buffer.extend_from_slice(&data);
                    String::from_utf8(buffer.to_vec())
                        .map(Some)
                        .map_err(|err| format!("fragmented message is not UTF-8: {}", err))
                }
                Some(Fragments::Binary) => Ok(None),
                None => Err("continuation without a first fragment".to_string()),
            },
        }
    }
}

/// Actor of one bot protocol connection.
pub struct BotWebSocket {
    conversation: Arc<Conversation>,
    /// Moved onto its own task once the actor starts
    session: Option<ProtocolSession>,
    frames: Option<mpsc::UnboundedSender<String>>,
    fragments: Option<Fragments>,
    heartbeat: Heartbeat,
    last_heartbeat: Instant,
}

impl BotWebSocket {
    fn new(session: ProtocolSession, heartbeat: Heartbeat) -> Self {
        Self {
            conversation: session.conversation().clone(),
            session: Some(session),
            frames: None,
            fragments: None,
            heartbeat,
            last_heartbeat: Instant::now(),
        }
    }

    /// Hand one complete text message to the protocol session.
    fn forward(&self, text: String) {
        let forwarded = self
            .frames
            .as_ref()
            .map(|frames| frames.send(text).is_ok())
            .unwrap_or(false);
        if !forwarded {
            debug!("Dropping frame, protocol session is gone");
        }
    }
}

impl HasHeartbeat for BotWebSocket {
    fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl Actor for BotWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Bot WebSocket connection started");
        self.heartbeat.start(ctx);

        self.conversation.attach_sink(Arc::new(WsSink::new(ctx.address())));
        if let Some(session) = self.session.take() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.frames = Some(tx);
            actix::spawn(session.run(rx));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(conversation_id = self.conversation.id().unwrap_or_default(), "Bot WebSocket connection stopped");
        self.frames = None;
        self.conversation.end();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for BotWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => self.forward(text.to_string()),
            Ok(ws::Message::Binary(data)) => {
                debug!(bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "WebSocket closed by peer");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(item)) => match Fragments::push(&mut self.fragments, item) {
                Ok(Some(text)) => self.forward(text),
                Ok(None) => {}
                Err(reason) => warn!(reason = %reason, "Discarding fragmented message"),
            },
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for BotWebSocket {
    type Result = Result<(), SendError>;

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
        Ok(())
    }
}

impl Handler<CloseConnection> for BotWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseConnection, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// Push-only socket attached to a REST conversation.
pub struct PushWebSocket {
    conversation: Arc<Conversation>,
    heartbeat: Heartbeat,
    last_heartbeat: Instant,
}

impl HasHeartbeat for PushWebSocket {
    fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl Actor for PushWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(conversation_id = self.conversation.id().unwrap_or_default(), "Side channel connected");
        self.heartbeat.start(ctx);
        self.conversation.attach_sink(Arc::new(WsSink::new(ctx.address())));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(conversation_id = self.conversation.id().unwrap_or_default(), "Side channel closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PushWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                debug!("Ignoring inbound frame on push-only side channel");
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "Side channel protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for PushWebSocket {
    type Result = Result<(), SendError>;

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
        Ok(())
    }
}

impl Handler<CloseConnection> for PushWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseConnection, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

#[derive(Debug, Default, Deserialize)]
struct BotQuery {
    #[serde(rename = "echoTime")]
    echo_time: Option<u64>,
    bot: Option<String>,
}

/// Bot protocol endpoint.
pub async fn bot_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();
    let handshake = HandshakeRequest::from_http(&req);
    if config.auth.enforce_handshake {
        authorize(&handshake, &config.auth.access_token)?;
    }
    let supplied = supplied_token(handshake.headers);

    let query = web::Query::<BotQuery>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_default();
    let kind = match query.bot.as_deref() {
        Some(bot) => bot
            .parse::<BotKind>()
            .map_err(|err| AppError::BadRequest(err.to_string()))?,
        None => config.bot.kind,
    };

    let mut bot_settings = BotSettings::from_config(&config);
    if let Some(echo_time) = query.echo_time.filter(|ms| *ms > 0) {
        bot_settings = bot_settings.with_echo_interval(Duration::from_millis(echo_time));
    }

    info!(
        peer = ?req.connection_info().peer_addr(),
        bot = ?kind,
        "New bot WebSocket connection"
    );

    let handler = build_handler(kind, &bot_settings);
    let conversation = Conversation::new(state.registry.clone(), None);
    let session = ProtocolSession::new(
        conversation,
        handler,
        Arc::new(bot_settings),
        SessionSettings {
            configured_token: config.auth.access_token.clone(),
            supplied_token: supplied,
            media_format: config.audio.media_format.clone(),
            expiry: config.expiry(),
        },
    );

    let heartbeat = Heartbeat {
        interval: Duration::from_secs(config.server.keepalive_interval_secs),
        timeout: Duration::from_secs(config.server.client_timeout_secs),
    };
    ws::start(BotWebSocket::new(session, heartbeat), &req, stream)
}

/// Side channel endpoint of a REST conversation.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();
    authorize(&HandshakeRequest::from_http(&req), &config.auth.access_token)?;

    let conversation_id = path.into_inner();
    let conversation = state
        .registry
        .get(&conversation_id)
        .filter(|conversation| conversation.side_channel_enabled())
        .ok_or_else(|| {
            warn!(conversation_id = %conversation_id, "Side channel not enabled for conversation");
            AppError::NotFound(format!("conversation {} has no websocket", conversation_id))
        })?;

    let actor = PushWebSocket {
        conversation,
        heartbeat: Heartbeat {
            interval: Duration::from_secs(config.server.keepalive_interval_secs),
            timeout: Duration::from_secs(config.server.client_timeout_secs),
        },
        last_heartbeat: Instant::now(),
    };
    ws::start(actor, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};
    use bytes::Bytes;

    fn app_state(config: AppConfig) -> web::Data<AppState> {
        web::Data::new(AppState::new(config))
    }

    #[actix_web::test]
    async fn test_handshake_without_token_is_rejected() {
        let app = actix_test::init_service(
            App::new()
                .app_data(app_state(AppConfig::default()))
                .route("/ws", web::get().to(bot_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_unknown_bot_kind_is_bad_request() {
        let app = actix_test::init_service(
            App::new()
                .app_data(app_state(AppConfig::default()))
                .route("/ws", web::get().to(bot_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/ws?bot=parrot")
            .insert_header(("Authorization", "Bearer TOKEN"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_open_handshake_when_not_enforced() {
        let mut config = AppConfig::default();
        config.auth.enforce_handshake = false;
        let app = actix_test::init_service(
            App::new()
                .app_data(app_state(config))
                .route("/ws", web::get().to(bot_websocket)),
        )
        .await;

        // Passes authorization; without upgrade headers the handshake itself fails
        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_side_channel_requires_enabled_conversation() {
        let state = app_state(AppConfig::default());
        let app = actix_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/conversation/{id}/websocket", web::get().to(conversation_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/conversation/c1/websocket")
            .insert_header(("Authorization", "Bearer TOKEN"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    fn text_of(slot: &mut Option<Fragments>, items: Vec<Item>) -> Vec<Result<Option<String>, String>> {
        items.into_iter().map(|item| Fragments::push(slot, item)).collect()
    }

    #[test]
    fn test_fragmented_text_is_reassembled() {
        let mut slot = None;
        let results = text_of(
            &mut slot,
            vec![
                Item::FirstText(Bytes::from_static(b"{\"type\":\"session.")),
                Item::Continue(Bytes::from_static(b"initiate\",")),
                Item::Last(Bytes::from_static(b"\"conversationId\":\"c1\"}")),
            ],
        );

        assert_eq!(results[0], Ok(None));
        assert_eq!(results[1], Ok(None));
        assert_eq!(
            results[2],
            Ok(Some("{\"type\":\"session.initiate\",\"conversationId\":\"c1\"}".to_string()))
        );
        assert!(slot.is_none());
    }

    #[test]
    fn test_fragmented_binary_is_dropped() {
        let mut slot = None;
        let results = text_of(
            &mut slot,
            vec![
                Item::FirstBinary(Bytes::from_static(&[1, 2])),
                Item::Continue(Bytes::from_static(&[3])),
                Item::Last(Bytes::from_static(&[4])),
            ],
        );

        assert!(results.iter().all(|result| *result == Ok(None)));
        assert!(slot.is_none());
    }

    #[test]
    fn test_stray_continuation_is_rejected() {
        let mut slot = None;
        assert!(Fragments::push(&mut slot, Item::Continue(Bytes::from_static(b"x"))).is_err());
        assert!(Fragments::push(&mut slot, Item::Last(Bytes::from_static(b"x"))).is_err());

        Fragments::push(&mut slot, Item::FirstText(Bytes::from_static(b"a"))).unwrap();
        assert!(Fragments::push(&mut slot, Item::FirstText(Bytes::from_static(b"b"))).is_err());
    }

    #[test]
    fn test_invalid_utf8_fragments_are_rejected() {
        let mut slot = None;
        Fragments::push(&mut slot, Item::FirstText(Bytes::from_static(&[0xff]))).unwrap();
        assert!(Fragments::push(&mut slot, Item::Last(Bytes::from_static(&[0xfe]))).is_err());
        assert!(slot.is_none());
    }
}
