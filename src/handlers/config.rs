use crate::config::AppConfig;
use crate::{auth::Authorized, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "********";

/// Configuration as exposed over HTTP, with the access token hidden.
fn redacted(config: &AppConfig) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(config).map_err(|e| AppError::Internal(e.to_string()))?;
    value["auth"]["access_token"] = json!(REDACTED);
    Ok(value)
}

pub async fn get_config(_auth: Authorized, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)?
    })))
}

pub async fn update_config(
    _auth: Authorized,
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated = state
        .update_config_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&updated)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    macro_rules! config_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .route("/api/v1/config", web::get().to(get_config))
                    .route("/api/v1/config", web::put().to(update_config)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_get_config_hides_token() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = config_app!(state);

        let req = test::TestRequest::get()
            .uri("/api/v1/config")
            .insert_header(("Authorization", "Bearer TOKEN"))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["auth"]["access_token"], REDACTED);
        assert_eq!(body["config"]["audio"]["media_format"], "raw/lpcm16");
    }

    #[actix_web::test]
    async fn test_config_requires_token() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = config_app!(state);

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = config_app!(state);

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .insert_header(("Authorization", "Bearer TOKEN"))
            .set_json(json!({"bot": {"kind": "voice-echo"}, "audio": {"echo_interval_ms": 3000}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().audio.echo_interval_ms, 3000);

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .insert_header(("Authorization", "Bearer TOKEN"))
            .set_json(json!({"conversation": {"expiry_seconds": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().conversation.expiry_seconds, 60);
    }
}
