use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.metrics.snapshot();
    let session_usage = metrics.active_sessions as f64
        / config.performance.max_concurrent_sessions.max(1) as f64;

    let status = if !config.has_api_key() {
        "degraded"
    } else if session_usage > 0.9 {
        "high_load"
    } else {
        "healthy"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "model": config.generation.model,
            "api_key_configured": config.has_api_key()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "max": config.performance.max_concurrent_sessions,
            "usage_percent": (session_usage * 100.0).round()
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let attempts = metrics.chunks_sent + metrics.rate_limit_retries;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "relay": metrics,
        "rates": {
            "chunk_failure_rate": if metrics.chunks_sent > 0 {
                metrics.chunks_failed as f64 / metrics.chunks_sent as f64
            } else {
                0.0
            },
            "rate_limited_share": if attempts > 0 {
                metrics.rate_limit_retries as f64 / attempts as f64
            } else {
                0.0
            },
            "payloads_per_minute": if uptime_seconds > 0 {
                metrics.payloads_received as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_missing_key() {
        let state = test_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["upstream"]["api_key_configured"], false);
        assert_eq!(body["sessions"]["active"], 0);
    }

    #[actix_web::test]
    async fn test_metrics_include_relay_counters() {
        let state = test_state(AppConfig::default());
        let _permit = state.try_open_session();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["relay"]["sessions_opened"], 1);
        assert_eq!(body["relay"]["active_sessions"], 1);
        assert_eq!(body["rates"]["chunk_failure_rate"], 0.0);
    }
}
