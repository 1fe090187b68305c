//! HTTP surface
//!
//! The WebSocket synthesis endpoint plus the small read-only REST paths:
//! health, readiness, and the voice listing.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::connection::ws_handler;
use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let ws_path = state.config.server.ws_path.clone();
    let cors_enabled = state.config.server.cors_enabled;

    let mut router = Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/stream/v1/tts/voices", get(list_voices))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}

/// List the voices the catalog can resolve
async fn list_voices(State(state): State<AppState>) -> Json<serde_json::Value> {
    let voices = state.catalog.list();
    Json(serde_json::json!({
        "voices": voices,
        "count": voices.len(),
    }))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: at least one healthy replica and headroom in the registry
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let healthy_replicas = state
        .router
        .replicas()
        .iter()
        .filter(|r| r.is_healthy())
        .count();

    Json(serde_json::json!({
        "status": if healthy_replicas > 0 { "ready" } else { "degraded" },
        "sessions": state.registry.count(),
        "active_jobs": state.router.total_active(),
        "healthy_replicas": healthy_replicas,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use speech_gateway_config::Settings;
    use speech_gateway_synth::SineBackend;
    use std::sync::Arc;

    #[test]
    fn test_router_creation() {
        let state = AppState::new(Settings::default(), Arc::new(SineBackend::default()));
        let _ = create_router(state);
    }
}
