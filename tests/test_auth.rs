//! Auth-required tools: token validation, claim injection, scope checks.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{initialize_params, request};
use fluxmcp::session::SessionId;
use fluxmcp::{
    AuthError, McpServer, TokenClaims, TokenValidator, ToolDef, ToolOutput,
};
use serde_json::{json, Value};

struct StaticValidator;

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        match token {
            "good-token" => Ok(TokenClaims {
                user_id: Some("user-7".into()),
                external_access_token: Some("ext-abc".into()),
                scopes: vec!["read".into()],
            }),
            _ => Err(AuthError::InvalidToken),
        }
    }
}

fn build_auth_server() -> McpServer {
    McpServer::builder()
        .token_validator(Arc::new(StaticValidator))
        .tool(
            ToolDef::new("whoami", |args, _ctx| async move {
                Ok(ToolOutput::from(Value::Object(args)))
            })
            .description("Echoes injected auth claims")
            .requires_auth(["read".to_owned()]),
        )
        .tool(
            ToolDef::new("wipe_all", |_args, _ctx| async move {
                Ok(ToolOutput::from("wiped"))
            })
            .description("Needs the admin scope")
            .requires_auth(["admin".to_owned()]),
        )
        .build()
        .unwrap()
}

async fn initialize(server: &McpServer) -> SessionId {
    server
        .protocol()
        .handle_value(
            request(1, "initialize", initialize_params(json!({}))),
            None,
            None,
            None,
        )
        .await
        .new_session
        .unwrap()
}

fn reply_json(handled: &fluxmcp::protocol::Handled) -> Value {
    serde_json::to_value(handled.reply.as_ref().unwrap()).unwrap()
}

#[tokio::test]
async fn test_missing_token_unauthorized() {
    let server = build_auth_server();
    let session = initialize(&server).await;
    let handled = server
        .protocol()
        .handle_value(
            request(2, "tools/call", json!({"name": "whoami", "arguments": {}})),
            Some(session),
            None,
            None,
        )
        .await;
    let reply = reply_json(&handled);
    assert_eq!(reply["error"]["code"], -32001);
    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("requires authorization"));
}

#[tokio::test]
async fn test_invalid_token_unauthorized() {
    let server = build_auth_server();
    let session = initialize(&server).await;
    let handled = server
        .protocol()
        .handle_value(
            request(2, "tools/call", json!({"name": "whoami", "arguments": {}})),
            Some(session),
            Some("expired-token".into()),
            None,
        )
        .await;
    let reply = reply_json(&handled);
    assert_eq!(reply["error"]["code"], -32001);
    // Validator details are sanitized.
    assert_eq!(reply["error"]["message"], "Token validation failed");
}

#[tokio::test]
async fn test_valid_token_injects_claims() {
    let server = build_auth_server();
    let session = initialize(&server).await;
    let handled = server
        .protocol()
        .handle_value(
            request(2, "tools/call", json!({"name": "whoami", "arguments": {}})),
            Some(session),
            Some("good-token".into()),
            None,
        )
        .await;
    let reply = reply_json(&handled);
    let text = reply["result"]["content"][0]["text"].as_str().unwrap();
    let echoed: Value = serde_json::from_str(text).unwrap();
    assert_eq!(echoed["_user_id"], "user-7");
    assert_eq!(echoed["_external_access_token"], "ext-abc");
}

#[tokio::test]
async fn test_insufficient_scope_forbidden() {
    let server = build_auth_server();
    let session = initialize(&server).await;
    let handled = server
        .protocol()
        .handle_value(
            request(2, "tools/call", json!({"name": "wipe_all", "arguments": {}})),
            Some(session),
            Some("good-token".into()),
            None,
        )
        .await;
    let reply = reply_json(&handled);
    assert_eq!(reply["error"]["code"], -32003);
    assert!(reply["error"]["message"].as_str().unwrap().contains("admin"));
}
