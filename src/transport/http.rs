//! Streamable HTTP transport.
//!
//! A single MCP endpoint: `POST /mcp` carries client requests (tool calls
//! answer over SSE so server-initiated frames can precede the final
//! response), `GET /mcp` opens the session's server-push stream with
//! `Last-Event-ID` replay, `DELETE /mcp` terminates the session, and
//! `POST /mcp/respond` carries client answers to server-initiated requests.
//! Health and OpenAPI endpoints ride alongside.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::context::Outbound;
use crate::error::{ErrorCode, ErrorData};
use crate::model::{ClientMessage, ProtocolVersion, RequestId, ServerMessage};
use crate::protocol::{method_allowed_without_session, ProtocolHandler, MAX_BODY_BYTES};
use crate::session::SessionId;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Ping cadence on SSE streams.
    pub sse_keep_alive: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: SSE_KEEP_ALIVE,
        }
    }
}

#[derive(Clone)]
struct AppState {
    protocol: Arc<ProtocolHandler>,
    config: HttpServerConfig,
}

/// Build the axum router exposing the MCP endpoint set.
pub struct McpRouter;

impl McpRouter {
    pub fn build(protocol: Arc<ProtocolHandler>, config: HttpServerConfig) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
            .expose_headers([HeaderName::from_static(HEADER_SESSION_ID)])
            .max_age(Duration::from_secs(86400));

        Router::new()
            .route(
                "/mcp",
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .route("/mcp/respond", post(handle_respond))
            .route("/health", get(handle_health))
            .route("/health/ready", get(handle_ready))
            .route("/health/detailed", get(handle_health_detailed))
            .route("/openapi.json", get(handle_openapi))
            .layer(cors)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES + 1024))
            .with_state(AppState { protocol, config })
    }
}

// ============================================================================
// Header helpers
// ============================================================================

fn session_header(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(SessionId::from)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn mcp_headers(session_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(HEADER_PROTOCOL_VERSION),
        HeaderValue::from_static(ProtocolVersion::LATEST.as_str()),
    );
    if let Some(session_id) = session_id {
        if let Ok(value) = HeaderValue::from_str(session_id) {
            headers.insert(HeaderName::from_static(HEADER_SESSION_ID), value);
        }
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers
}

// ============================================================================
// JSON-RPC HTTP responses
// ============================================================================

fn rpc_response(message: &ServerMessage, session_id: Option<&str>) -> Response {
    let status = match message {
        ServerMessage::Error(error) => match error.error.code {
            ErrorCode::PARSE_ERROR | ErrorCode::INVALID_REQUEST => StatusCode::BAD_REQUEST,
            ErrorCode::METHOD_NOT_FOUND => StatusCode::NOT_FOUND,
            ErrorCode::INVALID_PARAMS => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::OK,
        },
        _ => StatusCode::OK,
    };
    let body = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_owned());
    let mut response = (status, mcp_headers(session_id), body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn rpc_error(id: Option<RequestId>, error: ErrorData, session_id: Option<&str>) -> Response {
    rpc_response(&ServerMessage::error(id, error), session_id)
}

// ============================================================================
// POST /mcp
// ============================================================================

async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.protocol.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }

    if body.len() > MAX_BODY_BYTES {
        return rpc_error(None, ErrorData::invalid_request("Request body too large"), None);
    }
    if body.is_empty() {
        return rpc_error(None, ErrorData::parse_error("Parse error: empty body"), None);
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => {
            return rpc_error(
                None,
                ErrorData::parse_error(format!("Parse error: {error}")),
                None,
            );
        }
    };

    let session_id = session_header(&headers);
    let bearer = bearer_token(&headers);

    match value {
        Value::Array(batch) => handle_batch(state, batch, session_id, bearer).await,
        value => handle_single(state, value, session_id, bearer).await,
    }
}

async fn handle_batch(
    state: AppState,
    batch: Vec<Value>,
    session_id: Option<SessionId>,
    bearer: Option<String>,
) -> Response {
    if batch.is_empty() {
        return rpc_error(None, ErrorData::invalid_request("empty batch"), None);
    }
    let mut replies = Vec::new();
    let mut current_session = session_id;
    for item in batch {
        let handled = state
            .protocol
            .handle_value(item, current_session.clone(), bearer.clone(), None)
            .await;
        if let Some(created) = handled.new_session {
            current_session = Some(created);
        }
        if let Some(reply) = handled.reply {
            replies.push(reply);
        }
    }
    let body = serde_json::to_string(&replies).unwrap_or_else(|_| "[]".to_owned());
    let mut response = (
        StatusCode::OK,
        mcp_headers(current_session.as_deref()),
        body,
    )
        .into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

async fn handle_single(
    state: AppState,
    value: Value,
    session_id: Option<SessionId>,
    bearer: Option<String>,
) -> Response {
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    let is_request = value.get("id").is_some_and(|id| !id.is_null());

    if session_id.is_none() && !method_allowed_without_session(&method) {
        return (
            StatusCode::BAD_REQUEST,
            "Mcp-Session-Id header is required",
        )
            .into_response();
    }
    if let Some(sid) = &session_id {
        if method != "initialize" && !state.protocol.sessions.contains(sid) {
            return (StatusCode::NOT_FOUND, "Session not found").into_response();
        }
    }

    // Tool calls answer over SSE so server-initiated frames can flow before
    // the final response.
    if method == "tools/call" && is_request {
        if let Some(sid) = session_id.clone() {
            return tool_call_stream(state, value, sid, bearer).await;
        }
    }

    let handled = state
        .protocol
        .handle_value(value, session_id.clone(), bearer, None)
        .await;
    let effective_session = handled
        .new_session
        .as_deref()
        .or(session_id.as_deref());
    match handled.reply {
        Some(reply) => rpc_response(&reply, effective_session),
        None => (StatusCode::ACCEPTED, mcp_headers(effective_session)).into_response(),
    }
}

/// Answer a tool call with an SSE stream: `server_request` /
/// `server_notification` frames first, then the terminal `message` frame.
/// Every frame carries a per-session monotonic id and lands in the replay
/// buffer.
async fn tool_call_stream(
    state: AppState,
    value: Value,
    session_id: SessionId,
    bearer: Option<String>,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<Outbound>(STREAM_CHANNEL_CAPACITY);
    let protocol = state.protocol.clone();
    let dispatch_session = session_id.clone();
    let handle = tokio::spawn(async move {
        protocol
            .handle_value(value, Some(dispatch_session), bearer, Some(tx))
            .await
    });

    let protocol = state.protocol.clone();
    let stream_session = session_id.clone();
    let stream = async_stream::stream! {
        while let Some(outbound) = rx.recv().await {
            let (event, message) = match &outbound {
                Outbound::ServerRequest(message) => ("server_request", message),
                Outbound::ServerNotification(message) => ("server_notification", message),
            };
            let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_owned());
            let id = protocol.sse_events.push(&stream_session, event, data.clone());
            yield Ok::<_, Infallible>(
                Event::default().id(id.to_string()).event(event).data(data),
            );
        }
        // The sender half dropped: dispatch is finished.
        let reply = match handle.await {
            Ok(handled) => handled.reply,
            Err(join_error) => {
                tracing::error!(error = %join_error, "tool call task failed");
                Some(ServerMessage::error(None, ErrorData::internal_error()))
            }
        };
        if let Some(reply) = reply {
            let data = serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_owned());
            let id = protocol.sse_events.push(&stream_session, "message", data.clone());
            yield Ok(Event::default().id(id.to_string()).event("message").data(data));
        }
    };

    sse_response(stream, state.config.sse_keep_alive, Some(&session_id))
}

fn sse_response<S>(stream: S, keep_alive: Duration, session_id: Option<&str>) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive).text("ping"))
        .into_response();
    for (name, value) in mcp_headers(session_id) {
        if let Some(name) = name {
            response.headers_mut().insert(name, value);
        }
    }
    response
        .headers_mut()
        .insert(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));
    response
}

// ============================================================================
// GET /mcp — server push stream
// ============================================================================

/// Clears push-stream state when the client goes away.
struct PushStreamGuard {
    protocol: Arc<ProtocolHandler>,
    session_id: SessionId,
    tx: mpsc::Sender<Outbound>,
}

impl Drop for PushStreamGuard {
    fn drop(&mut self) {
        self.protocol
            .channel(&self.session_id)
            .clear_push_matching(&self.tx);
        self.protocol.sessions.set_protected(&self.session_id, false);
        tracing::debug!(session = %self.session_id, "push stream closed");
    }
}

async fn handle_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header is required").into_response();
    };
    if !state.protocol.sessions.contains(&session_id) {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    }

    let last_event_id: Option<u64> = headers
        .get(HeaderName::from_static("last-event-id"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let channel = state.protocol.channel(&session_id);
    let replayed = match last_event_id {
        Some(after) => state.protocol.sse_events.replay_after(&session_id, after),
        None => Vec::new(),
    };

    let (tx, mut rx) = mpsc::channel::<Outbound>(STREAM_CHANNEL_CAPACITY);
    if channel.set_push(tx.clone()).is_err() {
        if last_event_id.is_some() {
            // A live stream already exists; serve the replay alone.
            let stream = futures::stream::iter(replayed.into_iter().map(|event| {
                Ok::<_, Infallible>(
                    Event::default()
                        .id(event.id.to_string())
                        .event(event.event)
                        .data(event.data),
                )
            }));
            return sse_response(stream, state.config.sse_keep_alive, Some(&session_id));
        }
        return (StatusCode::CONFLICT, "A push stream is already active for this session")
            .into_response();
    }

    state.protocol.sessions.set_protected(&session_id, true);
    let guard = PushStreamGuard {
        protocol: state.protocol.clone(),
        session_id: session_id.clone(),
        tx,
    };

    let protocol = state.protocol.clone();
    let stream_session = session_id.clone();
    let stream = async_stream::stream! {
        let _guard = guard;
        for event in replayed {
            yield Ok::<_, Infallible>(
                Event::default()
                    .id(event.id.to_string())
                    .event(event.event)
                    .data(event.data),
            );
        }
        while let Some(outbound) = rx.recv().await {
            let (event, message) = match &outbound {
                Outbound::ServerRequest(message) => ("server_request", message),
                Outbound::ServerNotification(message) => ("server_notification", message),
            };
            let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_owned());
            let id = protocol.sse_events.push(&stream_session, event, data.clone());
            yield Ok(Event::default().id(id.to_string()).event(event).data(data));
        }
    };

    sse_response(stream, state.config.sse_keep_alive, Some(&session_id))
}

// ============================================================================
// DELETE /mcp & POST /mcp/respond
// ============================================================================

async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header is required").into_response();
    };
    if state.protocol.terminate_session(&session_id) {
        tracing::debug!(session = %session_id, "session terminated via DELETE");
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "Session not found").into_response()
    }
}

async fn handle_respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header is required").into_response();
    };
    let message: ClientMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(error) => {
            return rpc_error(
                None,
                ErrorData::parse_error(format!("Parse error: {error}")),
                Some(&session_id),
            );
        }
    };
    let resolved = match message {
        ClientMessage::Response(response) => state.protocol.resolve_server_request(
            Some(session_id.clone()),
            &response.id,
            Ok(response.result),
        ),
        ClientMessage::Error(error) => match &error.id {
            Some(id) => state.protocol.resolve_server_request(
                Some(session_id.clone()),
                id,
                Err(error.error.clone()),
            ),
            None => false,
        },
        _ => {
            return rpc_error(
                None,
                ErrorData::invalid_request("expected a JSON-RPC response"),
                Some(&session_id),
            );
        }
    };
    if resolved {
        (StatusCode::ACCEPTED, mcp_headers(Some(&session_id))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            "No pending server request with that id",
        )
            .into_response()
    }
}

// ============================================================================
// Health & OpenAPI
// ============================================================================

async fn handle_health(State(state): State<AppState>) -> Response {
    let stats = state.protocol.stats();
    let body = serde_json::json!({
        "status": "healthy",
        "uptime": stats.uptime_secs,
    });
    axum::Json(body).into_response()
}

async fn handle_ready(State(state): State<AppState>) -> Response {
    let ready = state.protocol.registry().tool_count() > 0;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        axum::Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
        })),
    )
        .into_response()
}

async fn handle_health_detailed(State(state): State<AppState>) -> Response {
    let stats = state.protocol.stats();
    axum::Json(serde_json::to_value(&stats).unwrap_or(Value::Null)).into_response()
}

/// OpenAPI 3.1 document synthesized from the registered tool schemas.
async fn handle_openapi(State(state): State<AppState>) -> Response {
    let protocol = &state.protocol;
    let info = protocol.server_info();
    let tools: Value = serde_json::from_str(
        protocol.registry().list_tools(None, Some(usize::MAX)).get(),
    )
    .unwrap_or(Value::Null);

    let mut paths = serde_json::Map::new();
    if let Some(tools) = tools.get("tools").and_then(Value::as_array) {
        for tool in tools {
            let Some(name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            let description = tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let schema = tool.get("inputSchema").cloned().unwrap_or(Value::Null);
            paths.insert(
                format!("/tools/{name}"),
                serde_json::json!({
                    "post": {
                        "operationId": name,
                        "summary": description,
                        "requestBody": {
                            "required": true,
                            "content": {"application/json": {"schema": schema}},
                        },
                        "responses": {
                            "200": {"description": "Tool result"},
                        },
                    }
                }),
            );
        }
    }

    axum::Json(serde_json::json!({
        "openapi": "3.1.0",
        "info": {
            "title": info.name,
            "version": info.version,
            "description": info.description,
        },
        "paths": paths,
    }))
    .into_response()
}
