//! Per-request context and the server-to-client request surface.
//!
//! A [`Context`] is handed to every handler invocation. It carries the
//! request-scoped state (session, user, progress token, accumulated resource
//! links, cancellation token) and exposes the four server-initiated
//! operations: sampling, elicitation, roots discovery, and progress.
//!
//! Context is threaded explicitly through handlers rather than stored in
//! task-local slots, so it survives every `await` and cannot leak across
//! concurrent requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{ContextError, ErrorData};
use crate::model::{
    ClientCapabilities, CreateMessageParams, CreateMessageResult, ElicitationParams,
    ElicitationResult, LogLevel, ProgressToken, RequestId, ResourceLink, Root, ServerMessage,
};
use crate::session::SessionId;

/// How long a server-initiated request waits for the client's answer.
pub const SERVER_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Cap on concurrently pending server-initiated requests per session.
pub const MAX_PENDING_SERVER_REQUESTS: usize = 100;

/// An outbound frame bound for the client, tagged with how the transport
/// should frame it (SSE event name on HTTP, plain line on stdio).
#[derive(Debug, Clone)]
pub enum Outbound {
    ServerRequest(ServerMessage),
    ServerNotification(ServerMessage),
}

impl Outbound {
    pub fn message(&self) -> &ServerMessage {
        match self {
            Outbound::ServerRequest(m) | Outbound::ServerNotification(m) => m,
        }
    }
}

type PendingSender = oneshot::Sender<Result<Value, ErrorData>>;

/// Per-session correlation state for server-initiated requests plus the
/// session's standalone push sink (the GET /mcp stream, or stdout on stdio).
///
/// Request ids live in a namespace disjoint from client ids (`s-<n>`), so a
/// client response is unambiguously a reply to a server request.
pub struct SessionChannel {
    session_id: SessionId,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingSender>>,
    push: Mutex<Option<mpsc::Sender<Outbound>>>,
    roots_cache: Mutex<Option<Vec<Root>>>,
}

impl SessionChannel {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            next_request_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            push: Mutex::new(None),
            roots_cache: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Install the standalone push sink. Fails if one is already active:
    /// at most one server-push stream per session.
    pub fn set_push(&self, tx: mpsc::Sender<Outbound>) -> Result<(), ()> {
        let mut push = self.push.lock().unwrap();
        match &*push {
            Some(existing) if !existing.is_closed() => Err(()),
            _ => {
                *push = Some(tx);
                Ok(())
            }
        }
    }

    pub fn clear_push(&self) {
        *self.push.lock().unwrap() = None;
    }

    /// Clear the push sink only if it is still `tx`'s channel. A stream that
    /// was already replaced must not wipe its successor.
    pub fn clear_push_matching(&self, tx: &mpsc::Sender<Outbound>) {
        let mut push = self.push.lock().unwrap();
        if push.as_ref().is_some_and(|current| current.same_channel(tx)) {
            *push = None;
        }
    }

    pub fn has_push(&self) -> bool {
        self.push
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn push_sink(&self) -> Option<mpsc::Sender<Outbound>> {
        self.push
            .lock()
            .unwrap()
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Send a server-initiated request over `stream` (the request-scoped SSE
    /// stream when present, falling back to the push stream) and await the
    /// client's response.
    pub async fn request_via(
        &self,
        stream: Option<&mpsc::Sender<Outbound>>,
        method: &str,
        params: Value,
    ) -> Result<Value, ContextError> {
        let sink = stream
            .cloned()
            .or_else(|| self.push_sink())
            .ok_or(ContextError::ChannelClosed)?;

        let id = format!("s-{}", self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.len() >= MAX_PENDING_SERVER_REQUESTS {
                return Err(ContextError::Backpressure);
            }
            pending.insert(id.clone(), tx);
        }

        let message = ServerMessage::request(RequestId::String(id.clone()), method, params);
        if sink.send(Outbound::ServerRequest(message)).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(ContextError::ChannelClosed);
        }

        match tokio::time::timeout(SERVER_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(ContextError::ClientError(error)),
            // Sender dropped: the channel was drained at shutdown.
            Ok(Err(_)) => Err(ContextError::Shutdown),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(ContextError::Timeout)
            }
        }
    }

    /// Fire-and-forget notification. Silent no-op when no stream is open.
    pub async fn notify_via(
        &self,
        stream: Option<&mpsc::Sender<Outbound>>,
        method: &str,
        params: Option<Value>,
    ) {
        let Some(sink) = stream.cloned().or_else(|| self.push_sink()) else {
            return;
        };
        let message = ServerMessage::notification(method, params);
        let _ = sink.send(Outbound::ServerNotification(message)).await;
    }

    /// Route a client response to its pending server request. Returns false
    /// when no matching request is waiting.
    pub fn resolve(&self, id: &RequestId, outcome: Result<Value, ErrorData>) -> bool {
        let key = id.to_string();
        let Some(tx) = self.pending.lock().unwrap().remove(&key) else {
            tracing::debug!(session = %self.session_id, %key, "response for unknown server request");
            return false;
        };
        let _ = tx.send(outcome);
        true
    }

    /// Drop every pending sender; each waiting handler observes `Shutdown`.
    pub fn fail_all_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub fn cached_roots(&self) -> Option<Vec<Root>> {
        self.roots_cache.lock().unwrap().clone()
    }

    pub fn cache_roots(&self, roots: Vec<Root>) {
        *self.roots_cache.lock().unwrap() = Some(roots);
    }

    pub fn invalidate_roots(&self) {
        *self.roots_cache.lock().unwrap() = None;
    }
}

/// Shared log-level threshold set via `logging/setLevel`.
#[derive(Clone, Default)]
pub struct LogThreshold(Arc<Mutex<Option<LogLevel>>>);

impl LogThreshold {
    pub fn set(&self, level: LogLevel) {
        *self.0.lock().unwrap() = Some(level);
    }

    pub fn allows(&self, level: LogLevel) -> bool {
        match *self.0.lock().unwrap() {
            Some(threshold) => level >= threshold,
            None => true,
        }
    }
}

/// Request-scoped context passed to every handler.
#[derive(Clone)]
pub struct Context {
    session_id: SessionId,
    request_id: Option<RequestId>,
    user_id: Option<String>,
    progress_token: Option<ProgressToken>,
    capabilities: ClientCapabilities,
    channel: Option<Arc<SessionChannel>>,
    /// Sink of the SSE stream answering the current request, when one exists.
    stream: Option<mpsc::Sender<Outbound>>,
    links: Arc<Mutex<Vec<ResourceLink>>>,
    log_threshold: LogThreshold,
    ct: CancellationToken,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        request_id: Option<RequestId>,
        capabilities: ClientCapabilities,
        channel: Option<Arc<SessionChannel>>,
        stream: Option<mpsc::Sender<Outbound>>,
        progress_token: Option<ProgressToken>,
        log_threshold: LogThreshold,
        ct: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            request_id,
            user_id: None,
            progress_token,
            capabilities,
            channel,
            stream,
            links: Arc::new(Mutex::new(Vec::new())),
            log_threshold,
            ct,
        }
    }

    /// A context with no transport attached. Server-to-client requests fail
    /// with `ChannelClosed`; notifications are dropped. Intended for direct
    /// handler invocation in tests and host tooling.
    pub fn detached(session_id: impl Into<SessionId>) -> Self {
        Self::new(
            session_id.into(),
            None,
            ClientCapabilities::default(),
            None,
            None,
            None,
            LogThreshold::default(),
            CancellationToken::new(),
        )
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub(crate) fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub(crate) fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Cooperative cancellation signal for this request. Handlers doing long
    /// work should poll or select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.ct.is_cancelled()
    }

    fn channel(&self) -> Result<&Arc<SessionChannel>, ContextError> {
        self.channel.as_ref().ok_or(ContextError::ChannelClosed)
    }

    /// Ask the client to run its LLM over the given messages
    /// (`sampling/createMessage`).
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, ContextError> {
        if !self.capabilities.supports_sampling() {
            return Err(ContextError::CapabilityUnavailable("sampling"));
        }
        let params = serde_json::to_value(params).map_err(|_| ContextError::UnexpectedResponse)?;
        let result = self
            .channel()?
            .request_via(self.stream.as_ref(), "sampling/createMessage", params)
            .await?;
        serde_json::from_value(result).map_err(|_| ContextError::UnexpectedResponse)
    }

    /// Ask the client to collect structured input from the user
    /// (`elicitation/create`).
    pub async fn create_elicitation(
        &self,
        params: ElicitationParams,
    ) -> Result<ElicitationResult, ContextError> {
        if !self.capabilities.supports_elicitation() {
            return Err(ContextError::CapabilityUnavailable("elicitation"));
        }
        let params = serde_json::to_value(params).map_err(|_| ContextError::UnexpectedResponse)?;
        let result = self
            .channel()?
            .request_via(self.stream.as_ref(), "elicitation/create", params)
            .await?;
        serde_json::from_value(result).map_err(|_| ContextError::UnexpectedResponse)
    }

    /// Discover the client's filesystem roots (`roots/list`). Results are
    /// cached per session until the client sends
    /// `notifications/roots/list_changed`.
    pub async fn list_roots(&self) -> Result<Vec<Root>, ContextError> {
        if !self.capabilities.supports_roots() {
            return Err(ContextError::CapabilityUnavailable("roots"));
        }
        let channel = self.channel()?;
        if let Some(roots) = channel.cached_roots() {
            return Ok(roots);
        }
        let result = channel
            .request_via(self.stream.as_ref(), "roots/list", Value::Object(Default::default()))
            .await?;
        let roots: Vec<Root> = serde_json::from_value(
            result.get("roots").cloned().unwrap_or(Value::Array(Vec::new())),
        )
        .map_err(|_| ContextError::UnexpectedResponse)?;
        channel.cache_roots(roots.clone());
        Ok(roots)
    }

    /// Report progress on the current request. No-op when the request carried
    /// no progress token or no stream is open.
    pub async fn send_progress(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let Some(channel) = &self.channel else {
            return;
        };
        let mut params = serde_json::Map::new();
        params.insert(
            "progressToken".into(),
            serde_json::to_value(token).unwrap_or(Value::Null),
        );
        params.insert("progress".into(), Value::from(progress));
        if let Some(total) = total {
            params.insert("total".into(), Value::from(total));
        }
        if let Some(message) = message {
            params.insert("message".into(), Value::from(message));
        }
        channel
            .notify_via(
                self.stream.as_ref(),
                "notifications/progress",
                Some(Value::Object(params)),
            )
            .await;
    }

    /// Forward a log record to the client (`notifications/message`), subject
    /// to the level set by `logging/setLevel`. Silent no-op without a stream.
    pub async fn send_log(&self, level: LogLevel, data: Value, logger: Option<&str>) {
        if !self.log_threshold.allows(level) {
            return;
        }
        let Some(channel) = &self.channel else {
            return;
        };
        let mut params = serde_json::Map::new();
        params.insert(
            "level".into(),
            serde_json::to_value(level).unwrap_or(Value::Null),
        );
        params.insert("data".into(), data);
        if let Some(logger) = logger {
            params.insert("logger".into(), Value::from(logger));
        }
        channel
            .notify_via(
                self.stream.as_ref(),
                "notifications/message",
                Some(Value::Object(params)),
            )
            .await;
    }

    /// Record a resource link to be attached to the tool result under
    /// `_meta.links`.
    pub fn add_resource_link(&self, link: ResourceLink) {
        self.links.lock().unwrap().push(link);
    }

    pub(crate) fn take_links(&self) -> Vec<ResourceLink> {
        std::mem::take(&mut *self.links.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> SessionChannel {
        SessionChannel::new(SessionId::from("session-1"))
    }

    #[tokio::test]
    async fn test_request_resolves_with_client_result() {
        let channel = Arc::new(channel());
        let (tx, mut rx) = mpsc::channel(8);

        let requester = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request_via(Some(&tx), "roots/list", serde_json::json!({}))
                    .await
            })
        };

        // The transport sees the outbound request and answers it.
        let outbound = rx.recv().await.unwrap();
        let frame = serde_json::to_value(outbound.message()).unwrap();
        assert_eq!(frame["method"], "roots/list");
        let id: RequestId = serde_json::from_value(frame["id"].clone()).unwrap();
        assert!(id.to_string().starts_with("s-"));

        assert!(channel.resolve(&id, Ok(serde_json::json!({"roots": []}))));
        let result = requester.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"roots": []}));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_without_stream_fails_closed() {
        let channel = channel();
        let err = channel
            .request_via(None, "roots/list", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_pending_cap_backpressure() {
        let channel = Arc::new(channel());
        let (tx, _rx) = mpsc::channel(MAX_PENDING_SERVER_REQUESTS + 8);

        let mut waiters = Vec::new();
        for _ in 0..MAX_PENDING_SERVER_REQUESTS {
            let channel = channel.clone();
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                channel
                    .request_via(Some(&tx), "roots/list", serde_json::json!({}))
                    .await
            }));
        }
        // Wait for every request to be registered before overflowing.
        while channel.pending_count() < MAX_PENDING_SERVER_REQUESTS {
            tokio::task::yield_now().await;
        }

        let err = channel
            .request_via(Some(&tx), "roots/list", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Backpressure));

        channel.fail_all_pending();
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap().unwrap_err(),
                ContextError::Shutdown
            ));
        }
    }

    #[tokio::test]
    async fn test_client_error_surfaces() {
        let channel = Arc::new(channel());
        let (tx, mut rx) = mpsc::channel(8);
        let requester = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request_via(Some(&tx), "sampling/createMessage", serde_json::json!({}))
                    .await
            })
        };
        let outbound = rx.recv().await.unwrap();
        let frame = serde_json::to_value(outbound.message()).unwrap();
        let id: RequestId = serde_json::from_value(frame["id"].clone()).unwrap();
        channel.resolve(
            &id,
            Err(ErrorData::new(
                crate::error::ErrorCode(-1),
                "user declined",
                None,
            )),
        );
        assert!(matches!(
            requester.await.unwrap().unwrap_err(),
            ContextError::ClientError(_)
        ));
    }

    #[tokio::test]
    async fn test_single_push_stream_per_session() {
        let channel = channel();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(channel.set_push(tx1).is_ok());
        assert!(channel.set_push(tx2).is_err());
        channel.clear_push();
        let (tx3, _rx3) = mpsc::channel(1);
        assert!(channel.set_push(tx3).is_ok());
    }

    #[tokio::test]
    async fn test_capability_gate() {
        let ctx = Context::detached("session-1");
        let err = ctx
            .create_message(CreateMessageParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::CapabilityUnavailable("sampling")));
    }

    #[tokio::test]
    async fn test_progress_without_token_is_noop() {
        let ctx = Context::detached("session-1");
        // Must not panic or block.
        ctx.send_progress(0.5, Some(1.0), Some("halfway")).await;
    }

    #[test]
    fn test_log_threshold_filtering() {
        let threshold = LogThreshold::default();
        assert!(threshold.allows(LogLevel::Debug));
        threshold.set(LogLevel::Warning);
        assert!(!threshold.allows(LogLevel::Info));
        assert!(threshold.allows(LogLevel::Error));
    }

    #[test]
    fn test_links_accumulate_and_drain() {
        let ctx = Context::detached("session-1");
        ctx.add_resource_link(ResourceLink {
            uri: "file:///a".into(),
            name: None,
            description: None,
            mime_type: None,
        });
        assert_eq!(ctx.take_links().len(), 1);
        assert!(ctx.take_links().is_empty());
    }
}
