use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let degraded = state.degradation.should_use_fallback();
    let connections = state.registry.connection_count();
    let max_connections = state.registry.max_connections();

    HttpResponse::Ok().json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "services": state.degradation.services(),
        "circuit_breaker": state.breaker.state(),
        "system": load_status(connections, max_connections)
    }))
}

fn load_status(connections: usize, max_connections: usize) -> serde_json::Value {
    let usage = if max_connections > 0 {
        connections as f64 / max_connections as f64
    } else {
        0.0
    };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "connection_usage_percent": (usage * 100.0).round(),
        "max_connections": max_connections,
        "current_connections": connections,
        "load_warnings": if usage > 0.8 {
            vec!["High connection usage - oldest connections will be evicted at the limit"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_status_levels() {
        assert_eq!(load_status(1, 10)["status"], "normal");
        assert_eq!(load_status(8, 10)["status"], "moderate_load");
        assert_eq!(load_status(10, 10)["status"], "high_load");
        assert_eq!(load_status(9, 10)["load_warnings"].as_array().unwrap().len(), 1);
        assert_eq!(load_status(0, 0)["connection_usage_percent"], 0.0);
    }
}
