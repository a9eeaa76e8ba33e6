//! # Bearer Token Authorization
//!
//! The platform authenticates with `Authorization: Bearer <token>` on the websocket
//! handshake and on every REST call. The token is compared with the configured access
//! token.
//!
//! ## Two entry points:
//! - [`authorize`]: predicate over the handshake request, evaluated before the
//!   websocket upgrade so a rejected client never sees a protocol message
//! - [`Authorized`]: actix-web extractor guarding the REST routes

use crate::error::AppError;
use crate::state::AppState;
use actix_web::dev::Payload;
use actix_web::http::header::{HeaderMap, AUTHORIZATION};
use actix_web::{web, FromRequest, HttpRequest};
use futures_util::future::{ready, Ready};
use tracing::warn;

/// Token of a `Bearer` authorization value. The scheme is case-insensitive.
pub fn extract_bearer(value: &str) -> Option<&str> {
    let mut parts = value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    parts.next()
}

/// Bearer token of a request, empty when absent or malformed.
pub fn supplied_token(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer)
        .unwrap_or_default()
        .to_string()
}

/// What the authorization predicate sees of a connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeRequest<'a> {
    pub origin: Option<&'a str>,
    pub is_secure: bool,
    pub headers: &'a HeaderMap,
}

impl<'a> HandshakeRequest<'a> {
    pub fn from_http(req: &'a HttpRequest) -> Self {
        Self {
            origin: req.headers().get("origin").and_then(|v| v.to_str().ok()),
            is_secure: req.connection_info().scheme() == "https",
            headers: req.headers(),
        }
    }
}

/// Accept the handshake when it carries `expected` as bearer token.
pub fn authorize(request: &HandshakeRequest<'_>, expected: &str) -> Result<(), AppError> {
    let token = supplied_token(request.headers);
    if token == expected {
        return Ok(());
    }
    warn!(
        origin = request.origin.unwrap_or("none"),
        secure = request.is_secure,
        "Rejected connection with invalid token"
    );
    Err(AppError::Unauthorized("Invalid token".to_string()))
}

/// Proof that a REST request carried the configured bearer token.
#[derive(Debug)]
pub struct Authorized;

impl FromRequest for Authorized {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let Some(state) = req.app_data::<web::Data<AppState>>() else {
            return ready(Err(AppError::Internal("application state missing".to_string())));
        };
        let expected = state.get_config().auth.access_token;
        ready(authorize(&HandshakeRequest::from_http(req), &expected).map(|()| Authorized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::HeaderValue;

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer TOKEN"), Some("TOKEN"));
        assert_eq!(extract_bearer("bearer TOKEN"), Some("TOKEN"));
        assert_eq!(extract_bearer("BEARER  TOKEN"), Some("TOKEN"));
        assert_eq!(extract_bearer("Basic dXNlcg=="), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer(""), None);
    }

    #[test]
    fn test_authorize() {
        let good = headers("Bearer TOKEN");
        let request = HandshakeRequest {
            origin: Some("https://platform.example"),
            is_secure: true,
            headers: &good,
        };
        assert!(authorize(&request, "TOKEN").is_ok());
        assert!(authorize(&request, "OTHER").is_err());

        let missing = HeaderMap::new();
        let request = HandshakeRequest {
            origin: None,
            is_secure: false,
            headers: &missing,
        };
        assert!(matches!(authorize(&request, "TOKEN"), Err(AppError::Unauthorized(_))));
        assert_eq!(supplied_token(&missing), "");
    }
}
