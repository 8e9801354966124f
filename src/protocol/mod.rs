//! The MCP dispatch core.
//!
//! Validates every inbound JSON-RPC envelope, routes by method, establishes
//! the per-request [`Context`], correlates server-to-client requests, and
//! encodes responses. Both transports feed into [`ProtocolHandler::handle_value`]
//! and carry whatever frames it hands back.

pub mod events;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::auth::TokenValidator;
use crate::context::{Context, LogThreshold, Outbound, SessionChannel};
use crate::error::{ErrorCode, ErrorData, HandlerError};
use crate::model::{
    validate_envelope, CallToolResult, ClientMessage, CompletionArgument, CompletionReference,
    CompletionValues, Content, InitializeParams, InitializeResult, JsonObject, LogLevel,
    ProgressToken, ProtocolVersion, RequestId, ResultPayload, ServerCapabilities, ServerInfo,
    ServerMessage, TaskStatus,
};
use crate::rate_limit::TokenBucketRateLimiter;
use crate::registry::{Registry, RegisteredTool, ToolOutput, DEFAULT_PAGE_SIZE};
use crate::session::{Session, SessionId, SessionManager};
use crate::tasks::{TaskError, TaskManager};
use events::SseEventBuffer;

/// Maximum keys accepted in `tools/call` arguments.
pub const MAX_ARGUMENT_KEYS: usize = 100;
/// Maximum request body size, enforced at the transports.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Default graceful-shutdown drain window.
pub const DEFAULT_SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Methods accepted without an established session.
pub fn method_allowed_without_session(method: &str) -> bool {
    matches!(method, "initialize" | "ping")
}

/// Outcome of handling one inbound message.
#[derive(Debug, Default)]
pub struct Handled {
    /// The reply frame, absent for notifications and client responses.
    pub reply: Option<ServerMessage>,
    /// Set when this message created a session (`initialize`).
    pub new_session: Option<SessionId>,
}

impl Handled {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply: Some(reply),
            new_session: None,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct Stats {
    requests: AtomicU64,
    errors: AtomicU64,
    tool_calls: AtomicU64,
}

/// Counters surfaced by the health endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: f64,
    pub total_requests: u64,
    pub errors: u64,
    pub tool_calls: u64,
    pub sessions: usize,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub in_flight: usize,
}

pub struct ProtocolOptions {
    pub server_info: ServerInfo,
    pub capabilities: ServerCapabilities,
    pub rate_limit_rps: Option<f64>,
    pub token_validator: Option<Arc<dyn TokenValidator>>,
    /// Reject every method but `initialize`/`ping` until
    /// `notifications/initialized` arrives.
    pub strict_initialization: bool,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            server_info: ServerInfo {
                name: "fluxmcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                description: None,
                website_url: None,
                icons: None,
            },
            capabilities: ServerCapabilities::advertised(),
            rate_limit_rps: None,
            token_validator: None,
            strict_initialization: false,
        }
    }
}

pub struct ProtocolHandler {
    registry: Arc<Registry>,
    pub sessions: SessionManager,
    tasks: Arc<TaskManager>,
    rate_limiter: Option<TokenBucketRateLimiter>,
    channels: Mutex<HashMap<SessionId, Arc<SessionChannel>>>,
    subscriptions: Mutex<HashMap<SessionId, HashSet<String>>>,
    pub sse_events: SseEventBuffer,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
    token_validator: Option<Arc<dyn TokenValidator>>,
    strict_initialization: bool,
    log_threshold: LogThreshold,
    accepting: AtomicBool,
    started_at: Instant,
    stats: Stats,
}

impl ProtocolHandler {
    pub fn new(registry: Arc<Registry>, options: ProtocolOptions) -> Arc<Self> {
        let handler = Arc::new(Self {
            registry,
            sessions: SessionManager::default(),
            tasks: Arc::new(TaskManager::new()),
            rate_limiter: options.rate_limit_rps.map(TokenBucketRateLimiter::new),
            channels: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            sse_events: SseEventBuffer::new(),
            in_flight: Mutex::new(HashMap::new()),
            server_info: options.server_info,
            capabilities: options.capabilities,
            token_validator: options.token_validator,
            strict_initialization: options.strict_initialization,
            log_threshold: LogThreshold::default(),
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
            stats: Stats::default(),
        });

        let weak: Weak<Self> = Arc::downgrade(&handler);
        handler.sessions.set_on_evict(move |session_id| {
            if let Some(handler) = weak.upgrade() {
                handler.cleanup_session_state(session_id);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&handler);
        handler.tasks.set_on_status(move |task| {
            let Some(handler) = weak.upgrade() else {
                return;
            };
            let Some(channel) = handler.existing_channel(&task.session_id) else {
                return;
            };
            let payload = task.to_wire();
            // Status notifications ride the session's push stream; skipped
            // when no runtime or stream is available.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    channel
                        .notify_via(None, "notifications/tasks/status", Some(payload))
                        .await;
                });
            }
        });

        handler
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            total_requests: self.stats.requests.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            tool_calls: self.stats.tool_calls.load(Ordering::Relaxed),
            sessions: self.sessions.len(),
            tools: self.registry.tool_count(),
            resources: self.registry.resource_count(),
            prompts: self.registry.prompt_count(),
            in_flight: self.in_flight.lock().unwrap().len(),
        }
    }

    // ------------------------------------------------------------------
    // Session channels
    // ------------------------------------------------------------------

    /// The channel for a session, created on demand.
    pub fn channel(&self, session_id: &SessionId) -> Arc<SessionChannel> {
        self.channels
            .lock()
            .unwrap()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionChannel::new(session_id.clone())))
            .clone()
    }

    fn existing_channel(&self, session_id: &str) -> Option<Arc<SessionChannel>> {
        self.channels.lock().unwrap().get(session_id).cloned()
    }

    // ------------------------------------------------------------------
    // Entry point
    // ------------------------------------------------------------------

    /// Handle one raw inbound message. `stream` is the sink of the SSE
    /// stream answering this request, when the transport opened one.
    pub async fn handle_value(
        &self,
        raw: Value,
        session_id: Option<SessionId>,
        bearer: Option<String>,
        stream: Option<mpsc::Sender<Outbound>>,
    ) -> Handled {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let id_hint = raw.get("id").and_then(|id| {
            serde_json::from_value::<RequestId>(id.clone()).ok()
        });
        if let Err(reason) = validate_envelope(&raw) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Handled::reply(ServerMessage::error(
                id_hint,
                ErrorData::invalid_request(reason),
            ));
        }

        let message: ClientMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(_) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Handled::reply(ServerMessage::error(
                    id_hint,
                    ErrorData::invalid_request("malformed JSON-RPC message"),
                ));
            }
        };

        match message {
            ClientMessage::Request(request) => {
                self.handle_request(request, session_id, bearer, stream).await
            }
            ClientMessage::Notification(notification) => {
                self.handle_notification(&notification.method, notification.params, session_id);
                Handled::none()
            }
            ClientMessage::Response(response) => {
                self.resolve_server_request(session_id, &response.id, Ok(response.result));
                Handled::none()
            }
            ClientMessage::Error(error) => {
                if let Some(id) = &error.id {
                    self.resolve_server_request(session_id, id, Err(error.error));
                }
                Handled::none()
            }
        }
    }

    /// Route a client's answer to its pending server-initiated request
    /// (stdio response lines and `POST /mcp/respond` both land here).
    pub fn resolve_server_request(
        &self,
        session_id: Option<SessionId>,
        id: &RequestId,
        outcome: Result<Value, ErrorData>,
    ) -> bool {
        match session_id.and_then(|sid| self.existing_channel(&sid)) {
            Some(channel) => channel.resolve(id, outcome),
            None => false,
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>, session_id: Option<SessionId>) {
        match method {
            "notifications/initialized" => {
                if let Some(session_id) = &session_id {
                    self.sessions.mark_initialized(session_id);
                    tracing::debug!(session = %session_id, "session initialized");
                }
            }
            "notifications/cancelled" => {
                let request_id = params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
                if let (Some(session_id), Some(request_id)) = (session_id, request_id) {
                    self.cancel_in_flight(&session_id, &request_id);
                }
            }
            "notifications/roots/list_changed" => {
                if let Some(channel) = session_id.and_then(|sid| self.existing_channel(&sid)) {
                    channel.invalidate_roots();
                }
            }
            other => {
                tracing::debug!(method = other, "ignoring unknown notification");
            }
        }
    }

    async fn handle_request(
        &self,
        request: crate::model::JsonRpcRequest,
        session_id: Option<SessionId>,
        bearer: Option<String>,
        stream: Option<mpsc::Sender<Outbound>>,
    ) -> Handled {
        let id = request.id.clone();
        let method = request.method.as_str();
        let params = request
            .params
            .unwrap_or_else(|| Value::Object(JsonObject::new()));

        if !self.is_accepting() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Handled::reply(ServerMessage::error(
                Some(id),
                ErrorData::new(ErrorCode::INTERNAL_ERROR, "Server is shutting down", None),
            ));
        }

        if method == "initialize" {
            return self.handle_initialize(params, id);
        }

        let session = session_id.as_ref().and_then(|sid| {
            let session = self.sessions.get(sid);
            if session.is_some() {
                self.sessions.touch(sid);
            }
            session
        });

        if self.strict_initialization
            && method != "ping"
            && !session.as_ref().is_some_and(|s| s.initialized)
        {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Handled::reply(ServerMessage::error(
                Some(id),
                ErrorData::invalid_request("session is not initialized"),
            ));
        }

        if let (Some(limiter), Some(session)) = (&self.rate_limiter, &session) {
            if !limiter.allow(&session.id) {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Handled::reply(ServerMessage::error(
                    Some(id),
                    ErrorData::rate_limited(limiter.retry_after(&session.id)),
                ));
            }
        }

        let result = match method {
            "ping" => Ok(ResultPayload::Value(Value::Object(JsonObject::new()))),
            "tools/list" => Ok(self.handle_paginated_list(&params, |cursor, limit| {
                self.registry.list_tools(cursor, limit)
            })),
            "tools/call" => {
                self.stats.tool_calls.fetch_add(1, Ordering::Relaxed);
                self.handle_tools_call(params, &id, session.as_ref(), bearer, stream)
                    .await
            }
            "resources/list" => Ok(self.handle_paginated_list(&params, |cursor, limit| {
                self.registry.list_resources(cursor, limit)
            })),
            "resources/read" => self.handle_resources_read(&params, session.as_ref()).await,
            "resources/subscribe" => self.handle_subscription(&params, session.as_ref(), true),
            "resources/unsubscribe" => self.handle_subscription(&params, session.as_ref(), false),
            "resources/templates/list" => Ok(self.handle_paginated_list(&params, |cursor, limit| {
                self.registry.list_templates(cursor, limit)
            })),
            "prompts/list" => Ok(self.handle_paginated_list(&params, |cursor, limit| {
                self.registry.list_prompts(cursor, limit)
            })),
            "prompts/get" => self.handle_prompts_get(&params, session.as_ref()).await,
            "completion/complete" => self.handle_completion(&params).await,
            "logging/setLevel" => self.handle_set_level(&params),
            "tasks/get" => self.handle_tasks_get(&params),
            "tasks/result" => self.handle_tasks_result(&params),
            "tasks/list" => self.handle_tasks_list(&params, session.as_ref()),
            "tasks/cancel" => self.handle_tasks_cancel(&params),
            other => Err(ErrorData::method_not_found(other)),
        };

        match result {
            Ok(payload) => Handled::reply(ServerMessage::response(id, payload)),
            Err(error) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Handled::reply(ServerMessage::error(Some(id), error))
            }
        }
    }

    // ------------------------------------------------------------------
    // initialize
    // ------------------------------------------------------------------

    fn handle_initialize(&self, params: Value, id: RequestId) -> Handled {
        let params: InitializeParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(error) => {
                return Handled::reply(ServerMessage::error(
                    Some(id),
                    ErrorData::invalid_params(format!("invalid initialize params: {error}"), None),
                ));
            }
        };

        let requested = params
            .protocol_version
            .as_deref()
            .unwrap_or(ProtocolVersion::LATEST.as_str());
        let version = ProtocolVersion::negotiate(requested);

        let session_id = self.sessions.create(
            version,
            params.client_info.clone(),
            params.capabilities.clone(),
        );
        // Materialize the channel up front so push streams can attach.
        self.channel(&session_id);

        tracing::debug!(
            session = %session_id,
            client = %params.client_info.name,
            version = %version,
            sampling = params.capabilities.supports_sampling(),
            "initialized session"
        );

        let result = InitializeResult {
            protocol_version: version,
            server_info: self.server_info.clone(),
            capabilities: self.capabilities.clone(),
            session_id: session_id.to_string(),
        };
        let reply = ServerMessage::response(
            id,
            serde_json::to_value(result).unwrap_or(Value::Null),
        );
        Handled {
            reply: Some(reply),
            new_session: Some(session_id),
        }
    }

    // ------------------------------------------------------------------
    // tools/call
    // ------------------------------------------------------------------

    async fn handle_tools_call(
        &self,
        params: Value,
        id: &RequestId,
        session: Option<&Session>,
        bearer: Option<String>,
        stream: Option<mpsc::Sender<Outbound>>,
    ) -> Result<ResultPayload, ErrorData> {
        let Some(params) = params.as_object() else {
            return Err(ErrorData::invalid_params("params must be an object", None));
        };
        let name = match params.get("name") {
            Some(Value::String(name)) => name.clone(),
            _ => return Err(ErrorData::invalid_params("name must be a string", None)),
        };
        let mut arguments = match params.get("arguments") {
            None | Some(Value::Null) => JsonObject::new(),
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(other) => {
                return Err(ErrorData::invalid_params(
                    format!("arguments must be an object, got {}", json_type(other)),
                    None,
                ));
            }
        };
        if arguments.len() > MAX_ARGUMENT_KEYS {
            return Err(ErrorData::invalid_params(
                format!(
                    "Too many argument keys ({}, max {MAX_ARGUMENT_KEYS})",
                    arguments.len()
                ),
                None,
            ));
        }

        let Some(tool) = self.registry.tool(&name) else {
            return Err(ErrorData::invalid_params(
                self.registry.unknown_tool_message(&name),
                None,
            ));
        };

        let mut user_id = None;
        if tool.auth.required {
            user_id = self.authorize_tool(&tool, &name, bearer, &mut arguments).await?;
        }

        self.coerce_arguments(&tool, &name, &mut arguments)?;

        let meta = params.get("_meta").and_then(Value::as_object);
        let progress_token: Option<ProgressToken> = meta
            .and_then(|m| m.get("progressToken"))
            .and_then(|t| serde_json::from_value(t.clone()).ok());
        let task_requested = tool.task_mode
            || meta
                .and_then(|m| m.get("task"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let (session_id, capabilities) = match session {
            Some(session) => (session.id.clone(), session.client_capabilities.clone()),
            None => (SessionId::from(""), Default::default()),
        };
        let channel = (!session_id.is_empty()).then(|| self.channel(&session_id));

        if task_requested {
            // Background execution must not pin the request's SSE stream
            // open; its server-to-client traffic rides the push stream.
            return self
                .spawn_task_call(tool, name, arguments, session_id, capabilities, channel, progress_token)
                .map(ResultPayload::Value);
        }

        let ct = CancellationToken::new();
        let flight_key = in_flight_key(&session_id, id);
        self.in_flight
            .lock()
            .unwrap()
            .insert(flight_key.clone(), ct.clone());

        let ctx = Context::new(
            session_id,
            Some(id.clone()),
            capabilities,
            channel,
            stream,
            progress_token,
            self.log_threshold.clone(),
            ct.clone(),
        )
        .with_user_id(user_id);

        let outcome = self.invoke_tool(&tool, &name, arguments, &ctx, &ct).await;
        self.in_flight.lock().unwrap().remove(&flight_key);

        match outcome {
            Ok(output) => Ok(ResultPayload::Value(normalize_output(&tool, output, &ctx))),
            Err(error) => Err(error),
        }
    }

    async fn invoke_tool(
        &self,
        tool: &Arc<RegisteredTool>,
        name: &str,
        arguments: JsonObject,
        ctx: &Context,
        ct: &CancellationToken,
    ) -> Result<ToolOutput, ErrorData> {
        let span = tracing::info_span!("mcp.tool", otel.name = %format!("mcp.tool.{name}"));
        let call = (tool.handler)(arguments, ctx.clone());
        tokio::select! {
            result = call.instrument(span) => {
                result.map_err(|error| {
                    let data = error.into_error_data();
                    if data.code == ErrorCode::INTERNAL_ERROR {
                        tracing::error!(tool = name, "tool execution failed");
                    }
                    data
                })
            }
            _ = ct.cancelled() => {
                tracing::debug!(tool = name, "tool execution cancelled");
                Err(ErrorData::new(ErrorCode::INTERNAL_ERROR, "Request cancelled", None))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_task_call(
        &self,
        tool: Arc<RegisteredTool>,
        name: String,
        arguments: JsonObject,
        session_id: SessionId,
        capabilities: crate::model::ClientCapabilities,
        channel: Option<Arc<SessionChannel>>,
        progress_token: Option<ProgressToken>,
    ) -> Result<Value, ErrorData> {
        let task = self.tasks.create(session_id.clone(), &name, None);

        let ctx = Context::new(
            session_id,
            None,
            capabilities,
            channel,
            None,
            progress_token,
            self.log_threshold.clone(),
            task.ct.clone(),
        );

        let tasks = self.tasks.clone();
        let task_id = task.id.clone();
        let ct = task.ct.clone();
        let handler = tool.handler.clone();

        let span = tracing::info_span!("mcp.tool", otel.name = %format!("mcp.tool.{name}"));
        tokio::spawn(async move {
            let call = handler(arguments, ctx.clone());
            let outcome = tokio::select! {
                result = call.instrument(span) => Some(result),
                _ = ct.cancelled() => None,
            };
            match outcome {
                Some(Ok(output)) => {
                    let result = normalize_output(&tool, output, &ctx);
                    let _ = tasks.set_result(&task_id, result);
                }
                Some(Err(error)) => {
                    let _ = tasks.set_error(&task_id, error.into_error_data());
                }
                // Cancellation already transitioned the task.
                None => {}
            }
        });

        Ok(serde_json::json!({
            "taskId": task.id,
            "status": TaskStatus::Working,
        }))
    }

    async fn authorize_tool(
        &self,
        tool: &Arc<RegisteredTool>,
        name: &str,
        bearer: Option<String>,
        arguments: &mut JsonObject,
    ) -> Result<Option<String>, ErrorData> {
        let Some(token) = bearer else {
            return Err(ErrorData::unauthorized(format!(
                "Tool '{name}' requires authorization. Please authenticate first."
            )));
        };
        let Some(validator) = &self.token_validator else {
            return Err(ErrorData::unauthorized(format!(
                "Tool '{name}' requires authorization but no token validator is configured."
            )));
        };
        let claims = validator.validate(&token).await.map_err(|error| {
            tracing::warn!(tool = name, error = %error, "token validation failed");
            ErrorData::unauthorized("Token validation failed")
        })?;
        for scope in &tool.auth.scopes {
            if !claims.has_scope(scope) {
                return Err(ErrorData::forbidden_scope(scope));
            }
        }
        if let Some(external) = &claims.external_access_token {
            arguments.insert(
                "_external_access_token".into(),
                Value::String(external.clone()),
            );
        }
        if let Some(user_id) = &claims.user_id {
            arguments.insert("_user_id".into(), Value::String(user_id.clone()));
        }
        Ok(claims.user_id)
    }

    /// Apply defaults, report missing required parameters with their schema
    /// fragment, and coerce declared parameters toward the schema.
    fn coerce_arguments(
        &self,
        tool: &Arc<RegisteredTool>,
        name: &str,
        arguments: &mut JsonObject,
    ) -> Result<(), ErrorData> {
        for param in &tool.params {
            match arguments.get(&param.name) {
                None => {
                    if let Some(default) = &param.default {
                        arguments.insert(param.name.clone(), default.clone());
                    } else if !param.optional {
                        return Err(ErrorData::invalid_params(
                            format!(
                                "Tool '{name}': missing required argument '{}'",
                                param.name
                            ),
                            Some(serde_json::json!({
                                "param": param.name,
                                "schema": param.schema_fragment(),
                            })),
                        ));
                    }
                }
                Some(value) => {
                    let coerced = crate::schema::coerce_value(param, value.clone())
                        .map_err(|error| ErrorData::invalid_params(error.to_string(), None))?;
                    arguments.insert(param.name.clone(), coerced);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // resources & prompts
    // ------------------------------------------------------------------

    async fn handle_resources_read(
        &self,
        params: &Value,
        session: Option<&Session>,
    ) -> Result<ResultPayload, ErrorData> {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return Err(ErrorData::invalid_params("uri must be a string", None));
        };

        let ctx = self.read_context(session);
        if let Some(resource) = self.registry.resource(uri) {
            if let Some(cached) = resource.cached_contents() {
                return Ok(contents_payload(cached));
            }
            let contents = (resource.reader)(ctx)
                .await
                .map_err(HandlerError::into_error_data)?;
            resource.store_contents(&contents);
            return Ok(contents_payload(contents));
        }

        if let Some((template, vars)) = self.registry.match_template(uri) {
            let contents = (template.reader)(vars, ctx)
                .await
                .map_err(HandlerError::into_error_data)?;
            return Ok(contents_payload(contents));
        }

        Err(ErrorData::invalid_params(
            format!("Unknown resource: {uri}"),
            None,
        ))
    }

    fn handle_subscription(
        &self,
        params: &Value,
        session: Option<&Session>,
        subscribe: bool,
    ) -> Result<ResultPayload, ErrorData> {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return Err(ErrorData::invalid_params("uri must be a string", None));
        };
        if let Some(session) = session {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if subscribe {
                subscriptions
                    .entry(session.id.clone())
                    .or_default()
                    .insert(uri.to_owned());
                tracing::debug!(session = %session.id, uri, "subscribed");
            } else if let Some(set) = subscriptions.get_mut(session.id.as_ref()) {
                set.remove(uri);
            }
        }
        Ok(ResultPayload::Value(Value::Object(JsonObject::new())))
    }

    async fn handle_prompts_get(
        &self,
        params: &Value,
        session: Option<&Session>,
    ) -> Result<ResultPayload, ErrorData> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(ErrorData::invalid_params("name must be a string", None));
        };
        let Some(prompt) = self.registry.prompt(name) else {
            return Err(ErrorData::invalid_params(
                format!("Unknown prompt: {name}"),
                None,
            ));
        };
        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for arg in prompt.prompt.arguments.iter().flatten() {
            if arg.required == Some(true) && !arguments.contains_key(&arg.name) {
                return Err(ErrorData::invalid_params(
                    format!("Prompt '{name}': missing required argument '{}'", arg.name),
                    None,
                ));
            }
        }

        let ctx = self.read_context(session);
        let messages = (prompt.renderer)(arguments, ctx)
            .await
            .map_err(HandlerError::into_error_data)?;

        let mut result = JsonObject::new();
        if let Some(description) = &prompt.prompt.description {
            result.insert("description".into(), Value::from(description.clone()));
        }
        result.insert(
            "messages".into(),
            serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new())),
        );
        Ok(ResultPayload::Value(Value::Object(result)))
    }

    fn read_context(&self, session: Option<&Session>) -> Context {
        match session {
            Some(session) => Context::new(
                session.id.clone(),
                None,
                session.client_capabilities.clone(),
                Some(self.channel(&session.id)),
                None,
                None,
                self.log_threshold.clone(),
                CancellationToken::new(),
            ),
            None => Context::detached(""),
        }
    }

    // ------------------------------------------------------------------
    // completion & logging
    // ------------------------------------------------------------------

    async fn handle_completion(&self, params: &Value) -> Result<ResultPayload, ErrorData> {
        let reference: CompletionReference = params
            .get("ref")
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())
            .ok_or_else(|| ErrorData::invalid_params("ref must name a known reference type", None))?;
        let argument: CompletionArgument = params
            .get("argument")
            .cloned()
            .and_then(|a| serde_json::from_value(a).ok())
            .ok_or_else(|| ErrorData::invalid_params("argument must carry name and value", None))?;

        let completion = match self.registry.completion_provider(reference.ref_type()) {
            Some(provider) => provider(reference, argument)
                .await
                .map_err(HandlerError::into_error_data)?,
            None => CompletionValues::default(),
        };
        Ok(ResultPayload::Value(serde_json::json!({
            "completion": completion,
        })))
    }

    fn handle_set_level(&self, params: &Value) -> Result<ResultPayload, ErrorData> {
        let Some(level) = params.get("level").and_then(Value::as_str) else {
            return Err(ErrorData::invalid_params("level must be a string", None));
        };
        let Some(level) = LogLevel::parse(level) else {
            return Err(ErrorData::invalid_params(
                format!(
                    "Invalid logging level: {level}. Must be one of: debug, info, notice, warning, error, critical, alert, emergency"
                ),
                None,
            ));
        };
        self.log_threshold.set(level);
        tracing::debug!(level = ?level, "client log threshold updated");
        Ok(ResultPayload::Value(Value::Object(JsonObject::new())))
    }

    // ------------------------------------------------------------------
    // tasks
    // ------------------------------------------------------------------

    fn task_param<'a>(&self, params: &'a Value) -> Result<&'a str, ErrorData> {
        params
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorData::invalid_params("id must be a string", None))
    }

    fn handle_tasks_get(&self, params: &Value) -> Result<ResultPayload, ErrorData> {
        let id = self.task_param(params)?;
        let task = self.tasks.get(id).map_err(task_error)?;
        Ok(ResultPayload::Value(task.to_wire()))
    }

    fn handle_tasks_result(&self, params: &Value) -> Result<ResultPayload, ErrorData> {
        let id = self.task_param(params)?;
        let task = self.tasks.result(id).map_err(task_error)?;
        Ok(ResultPayload::Value(task.to_wire()))
    }

    fn handle_tasks_list(
        &self,
        params: &Value,
        session: Option<&Session>,
    ) -> Result<ResultPayload, ErrorData> {
        let Some(session) = session else {
            return Ok(ResultPayload::Value(serde_json::json!({"tasks": []})));
        };
        let all: Vec<Value> = self
            .tasks
            .list(&session.id)
            .iter()
            .map(|t| t.to_wire())
            .collect();
        let cursor = params.get("cursor").and_then(Value::as_str);
        let offset = cursor.map(decode_offset).unwrap_or(0);
        let end = (offset + DEFAULT_PAGE_SIZE).min(all.len());
        let page: Vec<Value> = all
            .get(offset..end)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let mut result = JsonObject::new();
        result.insert("tasks".into(), Value::Array(page));
        if end < all.len() {
            result.insert("nextCursor".into(), Value::from(encode_offset(end)));
        }
        Ok(ResultPayload::Value(Value::Object(result)))
    }

    fn handle_tasks_cancel(&self, params: &Value) -> Result<ResultPayload, ErrorData> {
        let id = self.task_param(params)?;
        let task = self.tasks.cancel(id).map_err(task_error)?;
        Ok(ResultPayload::Value(task.to_wire()))
    }

    // ------------------------------------------------------------------
    // cancellation & in-flight tracking
    // ------------------------------------------------------------------

    fn cancel_in_flight(&self, session_id: &SessionId, request_id: &RequestId) {
        let key = in_flight_key(session_id, request_id);
        if let Some(ct) = self.in_flight.lock().unwrap().remove(&key) {
            ct.cancel();
            tracing::debug!(request = %request_id, "cancelled in-flight request");
        }
    }

    // ------------------------------------------------------------------
    // outbound fan-out
    // ------------------------------------------------------------------

    /// Push `notifications/resources/updated` to every session subscribed to
    /// the uri, and drop any cached contents for it.
    pub async fn notify_resource_updated(&self, uri: &str) {
        self.registry.invalidate_resource_cache(uri);
        let subscribers: Vec<SessionId> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .filter(|(_, uris)| uris.contains(uri))
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for session_id in subscribers {
            if let Some(channel) = self.existing_channel(&session_id) {
                channel
                    .notify_via(
                        None,
                        "notifications/resources/updated",
                        Some(serde_json::json!({ "uri": uri })),
                    )
                    .await;
            }
        }
    }

    async fn broadcast(&self, method: &str) {
        let channels: Vec<Arc<SessionChannel>> =
            self.channels.lock().unwrap().values().cloned().collect();
        for channel in channels {
            channel.notify_via(None, method, None).await;
        }
    }

    pub async fn notify_tools_list_changed(&self) {
        self.broadcast("notifications/tools/list_changed").await;
    }

    pub async fn notify_resources_list_changed(&self) {
        self.broadcast("notifications/resources/list_changed").await;
    }

    pub async fn notify_prompts_list_changed(&self) {
        self.broadcast("notifications/prompts/list_changed").await;
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Purge everything attached to one session. Invoked by the session
    /// manager's eviction hook and by explicit DELETE.
    fn cleanup_session_state(&self, session_id: &SessionId) {
        self.subscriptions.lock().unwrap().remove(session_id);
        self.sse_events.remove_session(session_id);
        if let Some(limiter) = &self.rate_limiter {
            limiter.remove(session_id);
        }
        self.tasks.purge_session(session_id);
        if let Some(channel) = self.channels.lock().unwrap().remove(session_id) {
            channel.fail_all_pending();
            channel.clear_push();
        }
        tracing::debug!(session = %session_id, "cleaned up session state");
    }

    /// Terminate a session explicitly (HTTP DELETE). Returns whether it
    /// existed.
    pub fn terminate_session(&self, session_id: &str) -> bool {
        self.sessions.terminate(session_id)
    }

    /// Graceful shutdown: stop accepting, drain in-flight work, cancel
    /// stragglers, fail pending server requests, clear all state.
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.in_flight.lock().unwrap().len();
            if remaining == 0 || Instant::now() >= deadline {
                if remaining > 0 {
                    tracing::warn!(remaining, "cancelling in-flight requests at shutdown");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for (_, ct) in self.in_flight.lock().unwrap().drain() {
            ct.cancel();
        }

        let channels: Vec<Arc<SessionChannel>> =
            self.channels.lock().unwrap().values().cloned().collect();
        for channel in channels {
            channel.fail_all_pending();
            channel.clear_push();
        }

        self.sessions.clear();
        self.tasks.clear();
        self.sse_events.clear();
        self.subscriptions.lock().unwrap().clear();
        if let Some(limiter) = &self.rate_limiter {
            limiter.clear();
        }
        self.channels.lock().unwrap().clear();
        tracing::debug!("protocol handler shut down");
    }

    // ------------------------------------------------------------------
    // shared helpers
    // ------------------------------------------------------------------

    fn handle_paginated_list(
        &self,
        params: &Value,
        list: impl Fn(Option<&str>, Option<usize>) -> Box<serde_json::value::RawValue>,
    ) -> ResultPayload {
        let cursor = params.get("cursor").and_then(Value::as_str);
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize);
        ResultPayload::Raw(list(cursor, limit))
    }
}

fn in_flight_key(session_id: &str, request_id: &RequestId) -> String {
    format!("{session_id}/{request_id}")
}

fn task_error(error: TaskError) -> ErrorData {
    ErrorData::invalid_params(error.to_string(), None)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn contents_payload(contents: crate::model::ResourceContents) -> ResultPayload {
    ResultPayload::Value(serde_json::json!({
        "contents": [contents],
    }))
}

fn encode_offset(offset: usize) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(offset.to_string())
}

fn decode_offset(cursor: &str) -> usize {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Normalize a tool's output to the MCP result shape. Pre-formatted results
/// pass through untouched apart from `_meta.links` augmentation.
fn normalize_output(tool: &RegisteredTool, output: ToolOutput, ctx: &Context) -> Value {
    let mut result = match output {
        ToolOutput::Raw(result) => result,
        ToolOutput::Content(content) => CallToolResult {
            content,
            ..Default::default()
        },
        ToolOutput::Value(value) => {
            let text = match &value {
                Value::String(text) => text.clone(),
                other => serde_json::to_string(other).unwrap_or_default(),
            };
            CallToolResult {
                content: vec![Content::text(text)],
                structured_content: tool.tool.output_schema.is_some().then_some(value),
                ..Default::default()
            }
        }
    };
    result.attach_links(ctx.take_links());
    serde_json::to_value(result).unwrap_or(Value::Null)
}
