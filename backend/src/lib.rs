//! Relay: an MCP Streamable HTTP server.
//!
//! This module exposes the application builder for use in tests.

use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{
    routing::{get, post},
    Json, Router,
};
use relay_types::{LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod api;
pub mod config;
pub mod logging;
pub mod mcp;
pub mod state;

use mcp::ProtocolEngine;
use state::AppState;

/// Create the Axum application router serving `engine` with default settings.
///
/// This function is used both by the main server binary and by integration tests.
pub fn create_app(engine: Arc<dyn ProtocolEngine>) -> Router {
    create_app_with_state(AppState::new(engine, config::TransportSettings::default()))
}

/// Create the Axum application router with a given state.
pub fn create_app_with_state(state: AppState) -> Router {
    let mcp_route = post(api::mcp::mcp_post)
        .get(api::mcp::mcp_get)
        .delete(api::mcp::mcp_delete)
        // HEAD must not reach the GET handler, which replaces the live stream
        .head(api::mcp::method_not_allowed)
        .fallback(api::mcp::method_not_allowed);

    let cors = {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                HeaderName::from_static(SESSION_ID_HEADER),
                HeaderName::from_static(LAST_EVENT_ID_HEADER),
            ])
            .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)]);

        // If no origins specified, allow any origin (the MCP endpoint still
        // rejects non-local origins). Otherwise, restrict to localhost and the
        // specified origins.
        let allowed = state.settings().allowed_origins.clone();
        if allowed.is_empty() {
            cors.allow_origin(Any)
        } else {
            cors.allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                    origin.to_str().is_ok_and(|o| {
                        api::mcp::is_localhost_origin(o) || allowed.iter().any(|a| a == o)
                    })
                },
            ))
            .allow_credentials(true)
        }
    };

    Router::new()
        .route("/health", get(health))
        .route("/mcp", mcp_route)
        .fallback(api::mcp::not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.sessions().len(),
    }))
}
