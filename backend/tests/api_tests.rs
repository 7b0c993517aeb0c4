//! Integration tests for the Relay MCP endpoint.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use relay::config::TransportSettings;
use relay::mcp::{text_result, McpHandler, ProtocolEngine, SessionHandle, Tool};
use relay::{create_app, create_app_with_state, state::AppState};
use relay_types::jsonrpc::{
    EVENTS_UNAVAILABLE, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR, SERVER_SHUTTING_DOWN, SESSION_NOT_FOUND, SESSION_REQUIRED,
};
use relay_types::{JsonRpcRequest, JsonRpcResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

/// Pushes `count` notifications to the calling session.
struct Emit;

#[async_trait]
impl Tool for Emit {
    fn name(&self) -> &str {
        "emit"
    }

    fn description(&self) -> &str {
        "Push notifications to the caller"
    }

    async fn call(&self, session: SessionHandle, arguments: Value) -> anyhow::Result<Value> {
        let count = arguments["count"].as_u64().unwrap_or(1);
        for i in 0..count {
            session.notify("notifications/progress", Some(json!({ "progress": i })))?;
        }
        Ok(text_result(format!("emitted {}", count)))
    }
}

/// Initializes normally, then fails every other request internally.
struct BrokenBackend {
    inner: McpHandler,
    fail_initialize: bool,
}

#[async_trait]
impl ProtocolEngine for BrokenBackend {
    async fn handle(
        &self,
        session: SessionHandle,
        request: JsonRpcRequest,
    ) -> anyhow::Result<Option<JsonRpcResponse>> {
        if request.method == "initialize" && !self.fail_initialize {
            return self.inner.handle(session, request).await;
        }
        anyhow::bail!("db password=hunter2 refused")
    }
}

/// Refuses every initialize with a protocol error.
struct VersionGate;

#[async_trait]
impl ProtocolEngine for VersionGate {
    async fn handle(
        &self,
        _session: SessionHandle,
        request: JsonRpcRequest,
    ) -> anyhow::Result<Option<JsonRpcResponse>> {
        Ok(Some(JsonRpcResponse::error(
            request.id,
            INVALID_PARAMS,
            "Unsupported protocol version",
        )))
    }
}

fn broken_app(fail_initialize: bool) -> (Router, AppState) {
    let engine = BrokenBackend {
        inner: McpHandler::new("relay"),
        fail_initialize,
    };
    let state = AppState::new(Arc::new(engine), TransportSettings::default());
    (create_app_with_state(state.clone()), state)
}

fn test_state(settings: TransportSettings) -> AppState {
    AppState::new(Arc::new(McpHandler::new("relay").with_tool(Emit)), settings)
}

/// Helper to create a test app instance.
fn create_test_app() -> (Router, AppState) {
    let state = test_state(TransportSettings::default());
    (create_app_with_state(state.clone()), state)
}

fn post(session_id: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(id) = session_id {
        builder = builder.header("mcp-session-id", id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn request(method: Method, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri("/mcp");
    if let Some(id) = session_id {
        builder = builder.header("mcp-session-id", id);
    }
    builder.body(Body::empty()).unwrap()
}

fn initialize_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": { "name": "test", "version": "0" }
        }
    })
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn session_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get("mcp-session-id")
        .map(|v| v.to_str().unwrap().to_string())
}

/// Initialize a session and return its id.
async fn initialize(app: &Router) -> String {
    let response = send(app, post(None, initialize_request())).await;
    assert_eq!(response.status(), StatusCode::OK);
    session_header(&response).expect("initialize must return a session id")
}

async fn emit(app: &Router, session_id: &str, count: u64) {
    let response = send(
        app,
        post(
            Some(session_id),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "emit", "arguments": { "count": count } }
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

/// Read the next SSE event from a streaming body, skipping keep-alive comments.
async fn next_event(body: &mut Body) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no event within timeout")
            .expect("stream ended")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            let text = String::from_utf8(data.to_vec()).unwrap();
            if !text.starts_with(':') {
                return text;
            }
        }
    }
}

/// The `id` field of an SSE event.
fn event_id(event: &str) -> Option<u64> {
    event
        .lines()
        .find_map(|line| line.strip_prefix("id:"))
        .and_then(|id| id.trim().parse().ok())
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = create_test_app();
    let response = send(
        &app,
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "ok", "sessions": 0}));
}

#[tokio::test]
async fn test_default_app_serves_initialize() {
    let app = create_app(Arc::new(McpHandler::new("relay")));
    let response = send(&app, post(None, initialize_request())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_header(&response).is_some());
}

#[tokio::test]
async fn test_initialize_creates_session() {
    let (app, state) = create_test_app();
    let response = send(&app, post(None, initialize_request())).await;

    assert_eq!(response.status(), StatusCode::OK);
    let session_id = session_header(&response).unwrap();
    let body = json_body(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["result"]["serverInfo"]["name"], "relay");

    assert_eq!(state.sessions().len(), 1);
    assert!(state.sessions().get(&session_id).unwrap().is_active());
}

#[tokio::test]
async fn test_sessions_get_distinct_ids() {
    let (app, _) = create_test_app();
    let a = initialize(&app).await;
    let b = initialize(&app).await;
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_request_without_session_is_rejected() {
    let (app, state) = create_test_app();
    let response = send(
        &app,
        post(None, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], SESSION_REQUIRED);
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn test_request_with_unknown_session_is_rejected() {
    let (app, _) = create_test_app();
    let response = send(
        &app,
        post(
            Some("does-not-exist"),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], SESSION_NOT_FOUND);
}

#[tokio::test]
async fn test_initialize_with_unknown_session_mints_new_one() {
    let (app, state) = create_test_app();
    let response = send(&app, post(Some("stale-id"), initialize_request())).await;

    assert_eq!(response.status(), StatusCode::OK);
    let session_id = session_header(&response).unwrap();
    assert_ne!(session_id, "stale-id");
    assert!(state.sessions().get("stale-id").is_none());
}

#[tokio::test]
async fn test_repeated_initialize_is_a_protocol_error() {
    let (app, state) = create_test_app();
    let session_id = initialize(&app).await;

    let response = send(&app, post(Some(&session_id), initialize_request())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["error"]["code"], INVALID_REQUEST);
    assert_eq!(state.sessions().len(), 1);
}

#[tokio::test]
async fn test_request_routed_to_engine() {
    let (app, _) = create_test_app();
    let session_id = initialize(&app).await;

    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": "abc", "method": "tools/list"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(session_header(&response).as_deref(), Some(session_id.as_str()));
    let body = json_body(response).await;
    assert_eq!(body["id"], "abc");
    assert_eq!(body["result"]["tools"][0]["name"], "emit");

    // Protocol errors are still HTTP 200
    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": 3, "method": "no/such/method"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["error"]["code"], METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_notifications_and_responses_are_accepted() {
    let (app, _) = create_test_app();
    let session_id = initialize(&app).await;

    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.is_empty());

    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": "srv-1", "result": {}}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_malformed_bodies() {
    let (app, _) = create_test_app();

    let response = send(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], PARSE_ERROR);
    assert_eq!(body["id"], Value::Null);

    let response = send(
        &app,
        post(None, json!([{"jsonrpc": "2.0", "id": 1, "method": "ping"}])),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], INVALID_REQUEST);

    let response = send(&app, post(None, json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_session() {
    let (app, state) = create_test_app();
    let session_id = initialize(&app).await;
    let session = state.sessions().get(&session_id).unwrap();

    let response = send(&app, request(Method::DELETE, Some(&session_id))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.sessions().is_empty());
    assert_eq!(session.state(), relay::mcp::SessionState::Closed);

    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, request(Method::DELETE, Some(&session_id))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_without_session_header() {
    let (app, _) = create_test_app();
    let response = send(&app, request(Method::DELETE, None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsupported_method_and_path() {
    let (app, _) = create_test_app();

    let response = send(&app, request(Method::PUT, None)).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()[header::ALLOW], "GET, POST, DELETE");
    assert_eq!(json_body(response).await["error"]["code"], INVALID_REQUEST);

    let response = send(
        &app,
        Request::builder()
            .uri("/nowhere")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], METHOD_NOT_FOUND);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn test_cors_preflight() {
    let (app, _) = create_test_app();
    let response = send(
        &app,
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/mcp")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "mcp-session-id")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert!(response.status().is_success());
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn test_foreign_origin_is_forbidden() {
    let (app, state) = create_test_app();
    let mut req = post(None, initialize_request());
    req.headers_mut()
        .insert(header::ORIGIN, "https://evil.example".parse().unwrap());

    let response = send(&app, req).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn test_configured_origin_is_allowed() {
    let state = test_state(TransportSettings {
        allowed_origins: vec!["https://app.example.com".to_string()],
        ..TransportSettings::default()
    });
    let app = create_app_with_state(state);
    let mut req = post(None, initialize_request());
    req.headers_mut()
        .insert(header::ORIGIN, "https://app.example.com".parse().unwrap());

    let response = send(&app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_stream_requires_session() {
    let (app, _) = create_test_app();

    let response = send(&app, request(Method::GET, None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, request(Method::GET, Some("does-not-exist"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_delivers_live_events() {
    let (app, _) = create_test_app();
    let session_id = initialize(&app).await;

    let response = send(&app, request(Method::GET, Some(&session_id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let mut body = response.into_body();

    emit(&app, &session_id, 1).await;
    let event = next_event(&mut body).await;
    assert_eq!(event_id(&event), Some(1), "{}", event);
    assert!(event.contains("notifications/progress"), "{}", event);
}

#[tokio::test]
async fn test_stream_resumes_after_last_event_id() {
    let (app, _) = create_test_app();
    let session_id = initialize(&app).await;
    emit(&app, &session_id, 2).await;

    let mut req = request(Method::GET, Some(&session_id));
    req.headers_mut()
        .insert("last-event-id", "1".parse().unwrap());
    let response = send(&app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let event = next_event(&mut body).await;
    assert_eq!(event_id(&event), Some(2), "{}", event);

    emit(&app, &session_id, 1).await;
    let event = next_event(&mut body).await;
    assert_eq!(event_id(&event), Some(3), "{}", event);
}

#[tokio::test]
async fn test_sessions_do_not_see_each_others_events() {
    let (app, _) = create_test_app();
    let a = initialize(&app).await;
    let b = initialize(&app).await;

    let response = send(&app, request(Method::GET, Some(&b))).await;
    let mut body_b = response.into_body();

    emit(&app, &a, 3).await;
    emit(&app, &b, 1).await;

    let event = next_event(&mut body_b).await;
    assert_eq!(event_id(&event), Some(1), "{}", event);
    let pending = tokio::time::timeout(Duration::from_millis(100), body_b.frame()).await;
    assert!(pending.is_err(), "session b received a foreign event");
}

#[tokio::test]
async fn test_new_stream_closes_previous_one() {
    let (app, _) = create_test_app();
    let session_id = initialize(&app).await;

    let first = send(&app, request(Method::GET, Some(&session_id))).await;
    let mut first_body = first.into_body();
    let second = send(&app, request(Method::GET, Some(&session_id))).await;
    let mut second_body = second.into_body();

    let ended = tokio::time::timeout(Duration::from_secs(2), first_body.frame())
        .await
        .expect("first stream still open");
    assert!(ended.is_none());

    emit(&app, &session_id, 1).await;
    let event = next_event(&mut second_body).await;
    assert_eq!(event_id(&event), Some(1), "{}", event);
}

#[tokio::test]
async fn test_invalid_resume_cursors() {
    let state = test_state(TransportSettings {
        event_log_capacity: Some(2),
        ..TransportSettings::default()
    });
    let app = create_app_with_state(state);
    let session_id = initialize(&app).await;
    emit(&app, &session_id, 5).await;

    let get_after = |cursor: &'static str| {
        let mut req = request(Method::GET, Some(&session_id));
        req.headers_mut()
            .insert("last-event-id", cursor.parse().unwrap());
        req
    };

    // Evicted entries cannot be replayed
    let response = send(&app, get_after("1")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"]["code"], EVENTS_UNAVAILABLE);

    // Cursor past the log
    let response = send(&app, get_after("9")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, get_after("not-a-number")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Oldest retained is 4, so resuming after 3 is still gap-free
    let response = send(&app, get_after("3")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    assert_eq!(event_id(&next_event(&mut body).await), Some(4));
}

#[tokio::test]
async fn test_shutdown_refuses_new_sessions() {
    let (app, state) = create_test_app();
    let session_id = initialize(&app).await;
    let stream = send(&app, request(Method::GET, Some(&session_id))).await;
    let mut stream_body = stream.into_body();

    let report = state.lifecycle().shutdown().await;
    assert_eq!(report.sessions_closed, 1);
    assert_eq!(report.streams_closed, 1);
    assert_eq!(report.failures, 0);
    assert!(state.sessions().is_empty());

    let ended = tokio::time::timeout(Duration::from_secs(2), stream_body.frame())
        .await
        .expect("stream still open after shutdown");
    assert!(ended.is_none());

    let response = send(&app, post(None, initialize_request())).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"]["code"], SERVER_SHUTTING_DOWN);
}

#[tokio::test]
async fn test_failed_initialize_is_an_internal_error() {
    let (app, state) = broken_app(true);
    let mut body = initialize_request();
    body["id"] = json!(7);

    let response = send(&app, post(None, body)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(session_header(&response).is_none());
    let body = json_body(response).await;
    assert_eq!(body["id"], 7);
    assert_eq!(body["error"]["code"], INTERNAL_ERROR);
    assert_eq!(body["error"]["message"], "Internal error");
    assert!(!body.to_string().contains("hunter2"));
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn test_engine_failure_is_an_internal_error() {
    let (app, state) = broken_app(false);
    let session_id = initialize(&app).await;

    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": "req-9", "method": "tools/list"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["id"], "req-9");
    assert_eq!(body["error"]["code"], INTERNAL_ERROR);
    assert!(!body.to_string().contains("hunter2"));

    // The session survives a failed request
    assert!(state.sessions().get(&session_id).unwrap().is_active());

    // Failed notifications are still accepted
    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_rejected_initialize_opens_no_session() {
    let state = AppState::new(Arc::new(VersionGate), TransportSettings::default());
    let app = create_app_with_state(state.clone());

    let response = send(&app, post(None, initialize_request())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_header(&response).is_none());
    let body = json_body(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["error"]["code"], INVALID_PARAMS);
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn test_idle_stream_gets_keep_alives() {
    let state = test_state(TransportSettings {
        keep_alive_secs: 1,
        ..TransportSettings::default()
    });
    let app = create_app_with_state(state);
    let session_id = initialize(&app).await;

    let response = send(&app, request(Method::GET, Some(&session_id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let frame = tokio::time::timeout(Duration::from_secs(3), body.frame())
        .await
        .expect("no keep-alive within timeout")
        .expect("stream ended")
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.starts_with(':'), "{}", text);
    assert!(text.contains("keep-alive"), "{}", text);
}

#[tokio::test]
async fn test_head_does_not_touch_the_stream() {
    let (app, state) = create_test_app();
    let session_id = initialize(&app).await;

    let response = send(&app, request(Method::GET, Some(&session_id))).await;
    let mut body = response.into_body();

    let response = send(&app, request(Method::HEAD, Some(&session_id))).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(state.sessions().get(&session_id).unwrap().has_stream());

    emit(&app, &session_id, 1).await;
    let event = next_event(&mut body).await;
    assert_eq!(event_id(&event), Some(1), "{}", event);
}

#[tokio::test]
async fn test_abandoned_session_is_reclaimed() {
    let state = test_state(TransportSettings {
        session_idle_timeout_secs: 1,
        ..TransportSettings::default()
    });
    let app = create_app_with_state(state.clone());
    let session_id = initialize(&app).await;
    let reaper = state.spawn_reaper().expect("reaper enabled");

    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("idle session was not reclaimed");

    let response = send(
        &app,
        post(
            Some(&session_id),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    state.lifecycle().shutdown().await;
    tokio::time::timeout(Duration::from_secs(1), reaper)
        .await
        .expect("reaper still running after shutdown")
        .unwrap();
}
