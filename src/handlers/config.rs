use crate::{config::AppConfig, error::AppError, error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "***";

/// Config as exposed over HTTP: the API key never leaves the process.
fn redacted(mut config: AppConfig) -> AppConfig {
    if config.has_api_key() {
        config.generation.api_key = REDACTED.to_string();
    }
    config
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(state.get_config())
    })))
}

/// Partial update. New values apply to sessions opened after the call.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(current_config)
    })))
}
