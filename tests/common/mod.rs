//! Shared fixtures: a small server with the handler kinds the suites need.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fluxmcp::{
    Content, CreateMessageParams, HandlerError, McpServer, ParamKind, ParamSpec, PromptDef,
    PromptMessage, ResourceContents, ResourceDef, Role, SamplingMessage, TemplateDef, ToolDef,
    ToolOutput,
};
use serde_json::{json, Value};

pub fn build_server() -> McpServer {
    builder().build().expect("fixture server builds")
}

pub fn builder() -> fluxmcp::ServerBuilder {
    McpServer::builder()
        .name("fixture")
        .version("0.0.1")
        .tool(
            ToolDef::new("add", |args, _ctx| async move {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(ToolOutput::from(json!(a + b)))
            })
            .description("Add two numbers")
            .param(ParamSpec::integer("a"))
            .param(ParamSpec::integer("b")),
        )
        .tool(
            ToolDef::new("add_numbers", |args, _ctx| async move {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(ToolOutput::from(json!(a + b)))
            })
            .description("Add two numbers, verbosely named")
            .param(ParamSpec::integer("a"))
            .param(ParamSpec::integer("b")),
        )
        .tool(
            ToolDef::new("echo_tags", |args, _ctx| async move {
                Ok(ToolOutput::from(args.get("tags").cloned().unwrap_or(Value::Null)))
            })
            .param(ParamSpec::array("tags", ParamKind::String)),
        )
        .tool(
            ToolDef::new("boom", |_args, _ctx| async move {
                Err::<ToolOutput, _>(HandlerError::internal(std::io::Error::other(
                    "secret database error",
                )))
            })
            .description("Always fails internally"),
        )
        .tool(
            ToolDef::new("bad_params", |_args, _ctx| async move {
                Err::<ToolOutput, _>(HandlerError::invalid_params("ValueError: negative size"))
            })
            .description("Always reports invalid params"),
        )
        .tool(
            ToolDef::new("sampler", |_args, ctx| async move {
                let result = ctx
                    .create_message(CreateMessageParams {
                        messages: vec![SamplingMessage {
                            role: Role::User,
                            content: Content::text("hello"),
                        }],
                        max_tokens: 100,
                        ..Default::default()
                    })
                    .await?;
                let text = result.content.as_text().unwrap_or("").to_owned();
                Ok(ToolOutput::from(text))
            })
            .description("Asks the client's model for a message"),
        )
        .tool(
            ToolDef::new("slow", |_args, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::from("done"))
            })
            .description("Sleeps long enough to be cancelled"),
        )
        .tool(
            ToolDef::new("background_job", |_args, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(ToolOutput::from(json!({"report": "ready"})))
            })
            .description("Short long-running job")
            .long_running(),
        )
        .tool(
            ToolDef::new("render_view", |_args, _ctx| async move {
                let result = fluxmcp::CallToolResult {
                    content: vec![Content::text("rendered")],
                    structured_content: Some(json!({"rows": 3})),
                    is_error: None,
                    meta: None,
                };
                Ok(ToolOutput::from(result))
            })
            .description("Returns a pre-formatted MCP Apps view"),
        )
        .tool(
            ToolDef::new("export_report", |_args, ctx| async move {
                ctx.add_resource_link(fluxmcp::ResourceLink {
                    uri: "file:///report.csv".into(),
                    name: Some("report".into()),
                    description: None,
                    mime_type: Some("text/csv".into()),
                });
                Ok(ToolOutput::from("exported"))
            })
            .description("Exports a report and links it"),
        )
        .tool(
            ToolDef::new("confirm_delete", |_args, ctx| async move {
                let schema = json!({
                    "type": "object",
                    "properties": {"confirm": {"type": "boolean"}},
                    "required": ["confirm"],
                });
                let result = ctx
                    .create_elicitation(fluxmcp::ElicitationParams {
                        message: "Really delete?".into(),
                        requested_schema: schema.as_object().unwrap().clone(),
                        title: None,
                        description: None,
                    })
                    .await?;
                Ok(ToolOutput::from(json!({"action": result.action})))
            })
            .description("Asks the user for confirmation"),
        )
        .tool(
            ToolDef::new("connect_account", |_args, _ctx| async move {
                Err::<ToolOutput, _>(HandlerError::UrlElicitationRequired {
                    url: "https://example.com/authorize".into(),
                    description: Some("Connect your account".into()),
                })
            })
            .description("Needs a browser round-trip first"),
        )
        .resource(
            ResourceDef::new("config://app", "app-config", |_ctx| async move {
                Ok(ResourceContents::text(
                    "config://app",
                    Some("application/json".into()),
                    "{\"debug\":false}",
                ))
            })
            .description("Application configuration")
            .mime_type("application/json"),
        )
        .resource_template(TemplateDef::new(
            "file:///{path}",
            "file",
            |vars, _ctx| async move {
                let path = vars.get("path").cloned().unwrap_or_default();
                Ok(ResourceContents::text(
                    format!("file:///{path}"),
                    Some("text/plain".into()),
                    format!("contents of {path}"),
                ))
            },
        ))
        .prompt(
            PromptDef::new("greet", |args, _ctx| async move {
                let name = args
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("stranger");
                Ok(vec![PromptMessage::user(format!("Say hello to {name}"))])
            })
            .description("Greeting prompt")
            .argument("name", true),
        )
        .completion_provider(
            "ref/prompt",
            Arc::new(|_reference, argument| {
                Box::pin(async move {
                    let values = ["alice", "albert", "bob"]
                        .iter()
                        .filter(|v| v.starts_with(&argument.value))
                        .map(|v| (*v).to_owned())
                        .collect::<Vec<_>>();
                    Ok(fluxmcp::model::CompletionValues {
                        values,
                        has_more: false,
                        total: None,
                    })
                })
            }),
        )
}

/// Build a JSON-RPC request value.
pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

pub fn initialize_params(capabilities: Value) -> Value {
    json!({
        "protocolVersion": "2025-11-25",
        "capabilities": capabilities,
        "clientInfo": {"name": "test-client", "version": "1.0"},
    })
}
