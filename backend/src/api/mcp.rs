//! MCP Streamable HTTP endpoint handlers.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - Send a JSON-RPC message (returns JSON, or 202 for notifications)
//! - `GET /mcp` - Open SSE stream for server-initiated messages
//! - `DELETE /mcp` - Terminate a session

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use relay_types::{
    IncomingMessage, JsonRpcRequest, JsonRpcResponse, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER,
};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::error::TransportError;
use crate::mcp::session::RequestGuard;
use crate::mcp::Session;
use crate::state::AppState;

/// Whether an origin names the local machine.
pub fn is_localhost_origin(origin: &str) -> bool {
    let Some((_, rest)) = origin.split_once("://") else {
        return false;
    };
    let host = if let Some(bracketed) = rest.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        rest.split([':', '/']).next().unwrap_or_default()
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Validate Origin header for DNS rebinding protection.
///
/// Requests without an Origin (non-browser clients) are accepted. Localhost
/// origins are always accepted, others only when configured.
fn validate_origin(headers: &HeaderMap, allowed_origins: &[String]) -> Result<(), TransportError> {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };
    let Ok(origin) = origin.to_str() else {
        warn!("Rejecting MCP request with non-ASCII origin");
        return Err(TransportError::Forbidden);
    };
    if is_localhost_origin(origin) || allowed_origins.iter().any(|o| o == origin) {
        return Ok(());
    }
    warn!("Rejecting MCP request from origin: {}", origin);
    Err(TransportError::Forbidden)
}

/// Extract session ID from headers.
fn get_session_id(headers: &HeaderMap) -> Result<Option<String>, TransportError> {
    match headers.get(SESSION_ID_HEADER) {
        None => Ok(None),
        Some(value) => {
            let id = value
                .to_str()
                .map_err(|_| TransportError::InvalidHeader("Mcp-Session-Id"))?
                .trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
    }
}

/// Extract the resume cursor from `Last-Event-ID`.
fn get_last_event_id(headers: &HeaderMap) -> Result<Option<u64>, TransportError> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or(TransportError::InvalidHeader("Last-Event-ID"))
        })
        .transpose()
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(hv) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), hv);
    }
    response
}

fn json_response(response: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let resp = (StatusCode::OK, Json(response)).into_response();
    match session_id {
        Some(sid) => with_session_header(resp, sid),
        None => resp,
    }
}

/// Look up a registered session.
fn find_session(state: &AppState, session_id: &str) -> Result<Arc<Session>, TransportError> {
    state
        .sessions()
        .get(session_id)
        .ok_or(TransportError::SessionNotFound)
}

/// POST /mcp - Handle a JSON-RPC message.
///
/// An `initialize` request without a known session opens a new session and
/// returns its id in the `Mcp-Session-Id` header. Everything else requires that
/// header.
pub async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TransportError> {
    validate_origin(&headers, &state.settings().allowed_origins)?;

    let message = IncomingMessage::parse(&body).map_err(TransportError::Envelope)?;
    let session_id = get_session_id(&headers)?;

    if message.is_initialize() {
        let known = session_id
            .as_deref()
            .is_some_and(|id| state.sessions().get(id).is_some());
        if !known {
            if let IncomingMessage::Request(request) = message {
                return initialize_session(&state, request).await;
            }
        }
    }

    let session_id = session_id.ok_or(TransportError::SessionRequired)?;
    let session = find_session(&state, &session_id)?;
    let _guard = session.begin_request()?;

    match message {
        IncomingMessage::Request(request) => {
            debug!(
                "MCP POST: method={}, session={}",
                request.method, session_id
            );
            let id = request.id.clone();
            match session.handle(request).await {
                Ok(Some(response)) => Ok(json_response(response, Some(&session_id))),
                Ok(None) => Ok(StatusCode::ACCEPTED.into_response()),
                Err(e) => {
                    error!("MCP: Request failed in session {}: {:#}", session_id, e);
                    Err(TransportError::Internal { id })
                }
            }
        }
        IncomingMessage::Notification(notification) => {
            debug!(
                "MCP POST: notification={}, session={}",
                notification.method, session_id
            );
            if let Err(e) = session.handle(notification).await {
                error!(
                    "MCP: Notification failed in session {}: {:#}",
                    session_id, e
                );
            }
            Ok(StatusCode::ACCEPTED.into_response())
        }
        IncomingMessage::Response(response) => {
            debug!(
                "MCP POST: client response id={:?}, session={}",
                response.id, session_id
            );
            Ok(StatusCode::ACCEPTED.into_response())
        }
    }
}

/// Open a session for an `initialize` request.
///
/// The session only becomes visible as active when the engine accepted the
/// request; a rejected or failed initialize removes it again.
async fn initialize_session(
    state: &AppState,
    request: JsonRpcRequest,
) -> Result<Response, TransportError> {
    if state.is_shutting_down() {
        warn!("MCP: Refusing new session, server is shutting down");
        return Err(TransportError::ShuttingDown);
    }

    let session = state.sessions().create();
    let id = request.id.clone();
    let guard = claim_new_session(state, &session)?;
    let result = {
        let _guard = guard;
        session.handle(request).await
    };

    match result {
        Ok(Some(response)) if !response.is_error() => {
            if session.activate().is_err() || state.is_shutting_down() {
                session.close_now();
                state.sessions().remove(session.id());
                return Err(TransportError::ShuttingDown);
            }
            info!("MCP: New session initialized: {}", session.id());
            Ok(json_response(response, Some(session.id())))
        }
        Ok(Some(response)) => {
            debug!("MCP: Initialize rejected by engine, dropping session");
            session.close_now();
            state.sessions().remove(session.id());
            Ok(json_response(response, None))
        }
        Ok(None) => {
            error!("MCP: Engine returned no response to initialize");
            session.close_now();
            state.sessions().remove(session.id());
            Err(TransportError::Internal { id })
        }
        Err(e) => {
            error!("MCP: Initialize failed: {:#}", e);
            session.close_now();
            state.sessions().remove(session.id());
            Err(TransportError::Internal { id })
        }
    }
}

/// Register the initialize request on a freshly created session.
///
/// Only a shutdown can close a session nobody else knows about yet, so losing
/// that race means the server is going away.
fn claim_new_session(
    state: &AppState,
    session: &Arc<Session>,
) -> Result<RequestGuard, TransportError> {
    session.begin_initialize().map_err(|e| {
        debug!("MCP: New session closed before initialize: {}", e);
        state.sessions().remove(session.id());
        TransportError::ShuttingDown
    })
}

/// GET /mcp - Open SSE stream for server-initiated messages.
///
/// With `Last-Event-ID` the stream first replays everything the client missed.
/// Opening a stream closes any stream already attached to the session.
pub async fn mcp_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, TransportError> {
    validate_origin(&headers, &state.settings().allowed_origins)?;

    let session_id = get_session_id(&headers)?.ok_or(TransportError::SessionRequired)?;
    let session = find_session(&state, &session_id)?;
    let last_event_id = get_last_event_id(&headers)?;

    let entries = session.attach_stream(last_event_id, state.settings().stream_idle_timeout())?;
    info!(
        "MCP: SSE stream opened for session {} (after event {:?})",
        session_id, last_event_id
    );

    let stream = entries.map(|entry| {
        Ok::<_, Infallible>(
            Event::default()
                .id(entry.sequence.to_string())
                .data(entry.payload),
        )
    });

    let response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.settings().keep_alive())
                .text("keep-alive"),
        )
        .into_response();
    Ok(with_session_header(response, &session_id))
}

/// DELETE /mcp - Terminate a session.
///
/// Closes the live stream, waits for in-flight requests to finish, and
/// forgets the session.
pub async fn mcp_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, TransportError> {
    validate_origin(&headers, &state.settings().allowed_origins)?;

    let session_id = get_session_id(&headers)?.ok_or(TransportError::SessionRequired)?;
    let session = find_session(&state, &session_id)?;

    if let Err(e) = session.close(state.settings().drain_timeout()).await {
        warn!("MCP: {}", e);
    }
    state.sessions().remove(&session_id);
    info!("MCP: Session terminated: {}", session_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Any other method on the MCP endpoint.
pub async fn method_not_allowed() -> TransportError {
    TransportError::MethodNotAllowed
}

/// Any path the server does not serve.
pub async fn not_found() -> TransportError {
    TransportError::NotFound
}
