use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Merge a partial JSON document into the running configuration.
///
/// Registry and resilience settings take effect immediately; audio, playback and pipeline settings
/// apply to new connections. Startup-only settings are rejected with 400.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone())?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    fn app_state() -> web::Data<AppState> {
        web::Data::new(AppState::new(AppConfig::default()).unwrap())
    }

    #[actix_web::test]
    async fn test_update_applies_partial_document() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"connections": {"max_connections": 3}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.registry.max_connections(), 3);
        assert_eq!(state.get_config().audio.sample_rate, 16000);
    }

    #[actix_web::test]
    async fn test_resilience_update_reaches_budget_and_breaker() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"resilience": {
                "max_retries": 0,
                "circuit_failure_threshold": 1,
                "circuit_recovery_timeout_seconds": 2
            }}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(state.budget.max_retries(), 0);
        let breaker = state.breaker.snapshot();
        assert_eq!(breaker.failure_threshold, 1);
        assert_eq!(breaker.recovery_timeout_seconds, 2);
    }

    #[actix_web::test]
    async fn test_port_change_needs_a_restart() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"server": {"port": 9999}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_a_bad_request() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"playback": {"playback_queue_capacity": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().playback.playback_queue_capacity, 100);
    }
}
