use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Connection counts, error counts, retry policy, breaker state and degradation flags.
pub async fn get_status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "total_connections": state.registry.connection_count(),
        "active_connections": state.registry.active_connection_count(),
        "max_connections": state.registry.max_connections(),
        "error_counts": state.budget.snapshot(),
        "retry_policy": {
            "max_retries": state.budget.max_retries(),
            "retry_delay_seconds": state.budget.retry_delay().as_secs_f64()
        },
        "circuit_breaker": state.breaker.snapshot(),
        "fallback_mode": state.degradation.should_use_fallback(),
        "services": state.degradation.services(),
        "connections": state.registry.active_connections()
    })))
}
