//! Wire-format data types for the MCP protocol (JSON-RPC 2.0 envelope plus
//! the MCP-specific payloads).
//!
//! Everything here serializes to the camelCase wire form defined by the MCP
//! specification; internal field names stay snake_case.

mod content;
mod prompt;
mod resource;
mod tool;

pub use content::{CallToolResult, Content, ResourceLink};
pub use prompt::{Prompt, PromptArgument, PromptMessage, Role};
pub use resource::{Resource, ResourceContents, ResourceTemplate};
pub use tool::{Icon, Tool, ToolAnnotations};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorData;

pub type JsonObject = serde_json::Map<String, Value>;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request id: string or number. `null` ids are notifications and
/// never reach this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_owned())
    }
}

/// Progress tokens share the id shape: string or number.
pub type ProgressToken = RequestId;

/// One inbound JSON-RPC message from the client.
///
/// Variant order matters for `untagged` deserialization: a request has both
/// `method` and a non-null `id`; a notification has `method` only (or
/// `id: null`); a response carries `result` or `error` for a server-initiated
/// request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

/// The `result` member of an outbound response: either a structured value or
/// a pre-serialized fragment spliced from cached handler bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResultPayload {
    Value(Value),
    Raw(Box<serde_json::value::RawValue>),
}

impl From<Value> for ResultPayload {
    fn from(value: Value) -> Self {
        ResultPayload::Value(value)
    }
}

impl From<Box<serde_json::value::RawValue>> for ResultPayload {
    fn from(raw: Box<serde_json::value::RawValue>) -> Self {
        ResultPayload::Raw(raw)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: ResultPayload,
}

/// One outbound JSON-RPC message to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ServerResponse),
    Error(JsonRpcErrorResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl ServerMessage {
    pub fn response(id: RequestId, result: impl Into<ResultPayload>) -> Self {
        ServerMessage::Response(ServerResponse {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: result.into(),
        })
    }

    pub fn error(id: Option<RequestId>, error: ErrorData) -> Self {
        ServerMessage::Error(JsonRpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            error,
        })
    }

    pub fn request(id: RequestId, method: &str, params: Value) -> Self {
        ServerMessage::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.to_owned(),
            params: Some(params),
        })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        ServerMessage::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_owned(),
            params,
        })
    }

    /// The id this message answers, when it is a response or error.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            ServerMessage::Response(r) => Some(&r.id),
            ServerMessage::Error(e) => e.id.as_ref(),
            _ => None,
        }
    }
}

/// Validate the JSON-RPC envelope of a raw message before typed
/// deserialization. Returns an error string suitable for a `-32600` reply.
pub fn validate_envelope(value: &Value) -> Result<(), String> {
    let Some(obj) = value.as_object() else {
        return Err("message must be a JSON object".to_owned());
    };
    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        _ => return Err("missing or invalid jsonrpc version".to_owned()),
    }
    if let Some(method) = obj.get("method") {
        if !method.is_string() {
            return Err("method must be a string".to_owned());
        }
    } else if !obj.contains_key("result") && !obj.contains_key("error") {
        return Err("message must carry a method, result, or error".to_owned());
    }
    if let Some(id) = obj.get("id") {
        if !(id.is_null() || id.is_string() || id.is_i64() || id.is_u64()) {
            return Err("id must be null, a string, or a number".to_owned());
        }
    }
    Ok(())
}

// ============================================================================
// Protocol versions
// ============================================================================

/// An MCP protocol revision date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(&'static str);

impl ProtocolVersion {
    pub const V_2025_11_25: Self = Self("2025-11-25");
    pub const V_2025_06_18: Self = Self("2025-06-18");
    pub const V_2025_03_26: Self = Self("2025-03-26");

    pub const LATEST: Self = Self::V_2025_11_25;

    const KNOWN: [Self; 3] = [Self::V_2025_11_25, Self::V_2025_06_18, Self::V_2025_03_26];

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Accept any known version the client proposes; answer an unknown one
    /// with the server's preferred version.
    pub fn negotiate(requested: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|v| v.0 == requested)
            .unwrap_or(Self::LATEST)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

// ============================================================================
// Initialize payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Capabilities declared by the client at `initialize`. Presence of a key
/// means the client supports the corresponding server-initiated operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<JsonObject>,
    #[serde(flatten)]
    pub other: JsonObject,
}

impl ClientCapabilities {
    pub fn supports_sampling(&self) -> bool {
        self.sampling.is_some()
    }

    pub fn supports_elicitation(&self) -> bool {
        self.elicitation.is_some()
    }

    pub fn supports_roots(&self) -> bool {
        self.roots.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    #[serde(default)]
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icons: Option<Vec<Icon>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChanged {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChanged>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChanged>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
}

impl ServerCapabilities {
    /// The capability set this framework always exposes.
    pub fn advertised() -> Self {
        Self {
            tools: Some(ListChanged {
                list_changed: Some(true),
            }),
            resources: Some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            prompts: Some(ListChanged {
                list_changed: Some(true),
            }),
            logging: Some(JsonObject::new()),
            completions: Some(JsonObject::new()),
            experimental: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    pub server_info: ServerInfo,
    pub capabilities: ServerCapabilities,
    pub session_id: String,
}

// ============================================================================
// Logging levels (RFC 5424 subset used by MCP)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub fn parse(level: &str) -> Option<Self> {
        match level.to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "notice" => Some(Self::Notice),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            "alert" => Some(Self::Alert),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }

    /// Map onto the `tracing` level used for host-side log output.
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info | Self::Notice => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }
}

// ============================================================================
// Server-to-client request payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageParams {
    pub messages: Vec<SamplingMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageResult {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationParams {
    pub message: String,
    pub requested_schema: JsonObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationResult {
    pub action: ElicitationAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Completion
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum CompletionReference {
    #[serde(rename = "ref/resource")]
    Resource { uri: String },
    #[serde(rename = "ref/prompt")]
    Prompt { name: String },
}

impl CompletionReference {
    pub fn ref_type(&self) -> &'static str {
        match self {
            CompletionReference::Resource { .. } => "ref/resource",
            CompletionReference::Prompt { .. } => "ref/prompt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompletionArgument {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionValues {
    pub values: Vec<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Working,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_as_request() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Request(req) => {
                assert_eq!(req.method, "ping");
                assert_eq!(req.id, RequestId::Number(1));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_null_id_parses_as_notification() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":null,"method":"notifications/initialized"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Notification(_)));
    }

    #[test]
    fn test_client_response_parses_as_response() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"s-1","result":{"roots":[]}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Response(resp) => {
                assert_eq!(resp.id, RequestId::String("s-1".into()));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_rejects_wrong_version() {
        let value = serde_json::json!({"jsonrpc": "1.0", "id": 1, "method": "ping"});
        assert!(validate_envelope(&value).is_err());
    }

    #[test]
    fn test_envelope_rejects_non_string_method() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": 42});
        assert!(validate_envelope(&value).is_err());
    }

    #[test]
    fn test_envelope_rejects_object_id() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": {"a": 1}, "method": "ping"});
        assert!(validate_envelope(&value).is_err());
    }

    #[test]
    fn test_protocol_version_negotiation() {
        assert_eq!(
            ProtocolVersion::negotiate("2025-06-18"),
            ProtocolVersion::V_2025_06_18
        );
        assert_eq!(ProtocolVersion::negotiate("1999-01-01"), ProtocolVersion::LATEST);
    }

    #[test]
    fn test_initialize_result_wire_shape() {
        let result = InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            server_info: ServerInfo {
                name: "test".into(),
                version: "1.0".into(),
                title: None,
                description: None,
                website_url: None,
                icons: None,
            },
            capabilities: ServerCapabilities::advertised(),
            session_id: "abc".into(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["protocolVersion"], "2025-11-25");
        assert_eq!(json["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(json["sessionId"], "abc");
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Emergency);
        assert_eq!(LogLevel::parse("NOTICE"), Some(LogLevel::Notice));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_completion_reference_deserialization() {
        let resource: CompletionReference =
            serde_json::from_value(serde_json::json!({"type": "ref/resource", "uri": "db://x"}))
                .unwrap();
        assert_eq!(resource.ref_type(), "ref/resource");
        let prompt: CompletionReference =
            serde_json::from_value(serde_json::json!({"type": "ref/prompt", "name": "greet"}))
                .unwrap();
        assert_eq!(prompt.ref_type(), "ref/prompt");
    }

    #[test]
    fn test_client_capabilities_detection() {
        let caps: ClientCapabilities =
            serde_json::from_value(serde_json::json!({"sampling": {}, "roots": {"listChanged": true}}))
                .unwrap();
        assert!(caps.supports_sampling());
        assert!(caps.supports_roots());
        assert!(!caps.supports_elicitation());
    }
}
