use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    /// Session exhausted its token bucket.
    pub const RATE_LIMITED: Self = Self(-32000);
    pub const UNAUTHORIZED: Self = Self(-32001);
    pub const FORBIDDEN_SCOPE: Self = Self(-32003);
    /// The handler needs the user to visit a URL before it can proceed.
    pub const URL_ELICITATION_REQUIRED: Self = Self(-32042);
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, None)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    /// Generic internal error. Details are logged server-side, never sent on
    /// the wire.
    pub fn internal_error() -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, "Internal server error", None)
    }

    pub fn rate_limited(retry_after_secs: f64) -> Self {
        Self::new(
            ErrorCode::RATE_LIMITED,
            "Rate limit exceeded",
            Some(serde_json::json!({ "retryAfter": retry_after_secs })),
        )
    }

    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::UNAUTHORIZED, message, None)
    }

    pub fn forbidden_scope(scope: &str) -> Self {
        Self::new(
            ErrorCode::FORBIDDEN_SCOPE,
            format!("Insufficient scope: {scope} required"),
            None,
        )
    }
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({data})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Errors a tool, resource, or prompt handler may return.
///
/// The dispatch layer maps each variant onto its JSON-RPC error code; see
/// [`HandlerError::into_error_data`]. Anything that does not fit a specific
/// variant should use [`HandlerError::internal`] — the message is logged but a
/// sanitized "Internal server error" goes to the client.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("insufficient scope: {0}")]
    ForbiddenScope(String),

    /// Raised from deep inside a handler when the user must complete a flow
    /// at an external URL (URL-mode elicitation).
    #[error("URL elicitation required: {url}")]
    UrlElicitationRequired {
        url: String,
        description: Option<String>,
    },

    #[error("server-to-client request failed: {0}")]
    Context(#[from] ContextError),

    #[error("{0}")]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn internal(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Internal(error.into())
    }

    /// Convert into the wire error object, sanitizing internal details.
    pub fn into_error_data(self) -> ErrorData {
        match self {
            HandlerError::InvalidParams(message) => ErrorData::invalid_params(message, None),
            HandlerError::Unauthorized(message) => ErrorData::unauthorized(message),
            HandlerError::ForbiddenScope(scope) => ErrorData::forbidden_scope(&scope),
            HandlerError::UrlElicitationRequired { url, description } => {
                let mut data = serde_json::Map::new();
                data.insert("url".into(), Value::String(url.clone()));
                if let Some(description) = description {
                    data.insert("description".into(), Value::String(description));
                }
                ErrorData::new(
                    ErrorCode::URL_ELICITATION_REQUIRED,
                    format!("URL elicitation required: {url}"),
                    Some(Value::Object(data)),
                )
            }
            HandlerError::Context(error) => match error {
                ContextError::CapabilityUnavailable(capability) => ErrorData::new(
                    ErrorCode::INTERNAL_ERROR,
                    format!("capability_required: client does not support {capability}"),
                    None,
                ),
                other => {
                    tracing::warn!(error = %other, "server-to-client request failed");
                    ErrorData::internal_error()
                }
            },
            HandlerError::Internal(error) => {
                tracing::error!(error = %error, "handler error");
                ErrorData::internal_error()
            }
        }
    }
}

/// Failures of the server-to-client request surface exposed through
/// [`Context`](crate::context::Context).
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The client did not declare the capability at initialize.
    #[error("client did not declare the {0} capability")]
    CapabilityUnavailable(&'static str),

    /// The client did not answer within the request deadline (120 s).
    #[error("timed out waiting for client response")]
    Timeout,

    /// The server is draining; pending requests were failed.
    #[error("server is shutting down")]
    Shutdown,

    /// Too many server-to-client requests are already awaiting answers.
    #[error("too many pending server requests")]
    Backpressure,

    /// No stream is open to carry the request to the client.
    #[error("no active client stream")]
    ChannelClosed,

    /// The client answered with a JSON-RPC error.
    #[error("client returned error: {0}")]
    ClientError(ErrorData),

    /// The client's answer did not match the expected result shape.
    #[error("unexpected response shape from client")]
    UnexpectedResponse,
}

/// Errors rejected at registration time.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("a {kind} named {name:?} is already registered")]
    DuplicateName { kind: &'static str, name: String },

    #[error("invalid {kind} name {name:?}: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: &'static str,
    },

    #[error("parameter {param:?} of {name:?}: {reason}")]
    UnsupportedParameterType {
        name: String,
        param: String,
        reason: &'static str,
    },

    #[error("no {kind} named {name:?} is registered")]
    NotFound { kind: &'static str, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_data_display() {
        let error = ErrorData::new(ErrorCode::INVALID_REQUEST, "Invalid Request", None);
        assert_eq!(format!("{error}"), "-32600: Invalid Request");
    }

    #[test]
    fn test_error_data_display_with_data() {
        let error = ErrorData::new(
            ErrorCode::INVALID_REQUEST,
            "Invalid Request",
            Some(serde_json::json!({"detail": "missing field"})),
        );
        assert_eq!(
            format!("{error}"),
            "-32600: Invalid Request({\"detail\":\"missing field\"})"
        );
    }

    #[test]
    fn test_url_elicitation_maps_to_dedicated_code() {
        let error = HandlerError::UrlElicitationRequired {
            url: "https://example.com/authorize".into(),
            description: Some("Connect your account".into()),
        };
        let data = error.into_error_data();
        assert_eq!(data.code, ErrorCode::URL_ELICITATION_REQUIRED);
        let payload = data.data.unwrap();
        assert_eq!(payload["url"], "https://example.com/authorize");
        assert_eq!(payload["description"], "Connect your account");
    }

    #[test]
    fn test_internal_error_is_sanitized() {
        let error = HandlerError::internal(std::io::Error::other("db password rejected"));
        let data = error.into_error_data();
        assert_eq!(data.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(data.message, "Internal server error");
        assert!(data.data.is_none());
    }

    #[test]
    fn test_capability_unavailable_names_capability() {
        let error = HandlerError::Context(ContextError::CapabilityUnavailable("sampling"));
        let data = error.into_error_data();
        assert_eq!(data.code, ErrorCode::INTERNAL_ERROR);
        assert!(data.message.contains("capability_required"));
        assert!(data.message.contains("sampling"));
    }

    #[test]
    fn test_error_data_serialization_skips_empty_data() {
        let error = ErrorData::method_not_found("tools/run");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["code"], -32601);
        assert!(json.get("data").is_none());
    }
}
