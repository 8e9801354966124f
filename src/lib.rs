//! fluxmcp — an MCP server framework core.
//!
//! A JSON-RPC 2.0 dispatch engine exposing registered tools, resources, and
//! prompts to LLM clients over two transports: a single-endpoint streamable
//! HTTP transport with SSE streaming and resumability, and a line-delimited
//! stdio transport. Handlers get a per-request [`Context`] with
//! server-initiated sampling, elicitation, roots discovery, and progress.
//!
//! ```no_run
//! use fluxmcp::{McpServer, ParamSpec, ToolDef, ToolOutput};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = McpServer::builder()
//!     .tool(
//!         ToolDef::new("add", |args, _ctx| async move {
//!             let a = args["a"].as_i64().unwrap_or(0);
//!             let b = args["b"].as_i64().unwrap_or(0);
//!             Ok(ToolOutput::from(serde_json::json!(a + b)))
//!         })
//!         .description("Add two numbers")
//!         .param(ParamSpec::integer("a"))
//!         .param(ParamSpec::integer("b")),
//!     )
//!     .build()?;
//! server.serve_http(([127, 0, 0, 1], 8000).into()).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod context;
mod error;
pub mod model;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod schema;
pub mod session;
pub mod tasks;
pub mod transport;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use auth::{AuthError, AuthRequirement, TokenClaims, TokenValidator};
pub use config::{ServerConfig, TransportKind};
pub use context::{Context, Outbound, SessionChannel};
pub use error::{ContextError, ErrorCode, ErrorData, HandlerError, RegistryError};
pub use model::{
    CallToolResult, Content, CreateMessageParams, CreateMessageResult, ElicitationParams,
    ElicitationResult, Icon, LogLevel, Prompt, PromptMessage, ProtocolVersion, Resource,
    ResourceContents, ResourceLink, ResourceTemplate, Role, Root, SamplingMessage, ServerInfo,
    Tool, ToolAnnotations,
};
pub use protocol::{ProtocolHandler, ProtocolOptions};
pub use registry::{
    CompletionFn, PromptDef, Registry, ResourceDef, TemplateDef, ToolDef, ToolOutput,
};
pub use schema::{ParamKind, ParamSpec};
pub use transport::{HttpServerConfig, McpRouter, StdioTransport};

/// A built MCP server: registry plus dispatch core, ready to serve on either
/// transport.
pub struct McpServer {
    protocol: Arc<ProtocolHandler>,
    config: ServerConfig,
}

impl McpServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn protocol(&self) -> &Arc<ProtocolHandler> {
        &self.protocol
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.protocol.registry()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The axum router for the MCP endpoint set; embed it in a larger app or
    /// drive it directly in tests.
    pub fn router(&self) -> axum::Router {
        McpRouter::build(self.protocol.clone(), HttpServerConfig::default())
    }

    /// Bind and serve the HTTP transport. Returns once the listener is
    /// accepting; use the handle to observe the bound address or stop the
    /// server.
    pub async fn serve_http(&self, addr: SocketAddr) -> io::Result<HttpServerHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let ct = CancellationToken::new();
        let shutdown_ct = ct.child_token();
        let router = self.router();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                shutdown_ct.cancelled().await;
                tracing::info!("http transport shutting down");
            });
            if let Err(error) = server.await {
                tracing::error!(%error, "http transport exited with error");
            }
        });
        tracing::info!(%addr, "mcp server listening");
        Ok(HttpServerHandle { addr, ct })
    }

    /// Serve the stdio transport until stdin closes.
    pub async fn serve_stdio(&self) -> io::Result<()> {
        StdioTransport::new(self.protocol.clone()).run().await
    }

    /// Serve whichever transport the configuration selects.
    pub async fn run(&self) -> io::Result<()> {
        match self.config.transport {
            TransportKind::Stdio => self.serve_stdio().await,
            TransportKind::Http => {
                let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
                let handle = self.serve_http(addr).await?;
                handle.ct.cancelled().await;
                Ok(())
            }
        }
    }

    /// Push `notifications/resources/updated` to subscribed sessions.
    pub async fn notify_resource_updated(&self, uri: &str) {
        self.protocol.notify_resource_updated(uri).await;
    }

    pub async fn notify_tools_list_changed(&self) {
        self.protocol.notify_tools_list_changed().await;
    }

    pub async fn notify_resources_list_changed(&self) {
        self.protocol.notify_resources_list_changed().await;
    }

    pub async fn notify_prompts_list_changed(&self) {
        self.protocol.notify_prompts_list_changed().await;
    }

    /// Graceful shutdown with the configured drain window.
    pub async fn shutdown(&self) {
        self.protocol.shutdown(self.config.shutdown_drain).await;
    }

    /// Graceful shutdown with an explicit drain window.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        self.protocol.shutdown(timeout).await;
    }
}

/// Handle on a running HTTP transport.
pub struct HttpServerHandle {
    pub addr: SocketAddr,
    ct: CancellationToken,
}

impl HttpServerHandle {
    pub fn cancel(&self) {
        self.ct.cancel();
    }
}

/// Collects registrations and configuration; `build` installs everything
/// into the registry before dispatch ever begins.
pub struct ServerBuilder {
    config: ServerConfig,
    server_info: Option<ServerInfo>,
    title: Option<String>,
    description: Option<String>,
    website_url: Option<String>,
    icons: Option<Vec<Icon>>,
    tools: Vec<ToolDef>,
    resources: Vec<ResourceDef>,
    templates: Vec<TemplateDef>,
    prompts: Vec<PromptDef>,
    completions: Vec<(&'static str, CompletionFn)>,
    token_validator: Option<Arc<dyn TokenValidator>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            server_info: None,
            title: None,
            description: None,
            website_url: None,
            icons: None,
            tools: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            prompts: Vec::new(),
            completions: Vec::new(),
            token_validator: None,
        }
    }

    /// Start from the process environment (`MCP_SERVER_NAME`, `PORT`, ...).
    pub fn from_env() -> Self {
        Self {
            config: ServerConfig::from_env(),
            ..Self::new()
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn website_url(mut self, url: impl Into<String>) -> Self {
        self.website_url = Some(url.into());
        self
    }

    pub fn icons(mut self, icons: Vec<Icon>) -> Self {
        self.icons = Some(icons);
        self
    }

    /// Full override of the advertised server info.
    pub fn server_info(mut self, info: ServerInfo) -> Self {
        self.server_info = Some(info);
        self
    }

    pub fn rate_limit_rps(mut self, rps: f64) -> Self {
        self.config.rate_limit_rps = Some(rps);
        self
    }

    pub fn strict_initialization(mut self, strict: bool) -> Self {
        self.config.strict_initialization = strict;
        self
    }

    pub fn token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.token_validator = Some(validator);
        self
    }

    pub fn tool(mut self, def: ToolDef) -> Self {
        self.tools.push(def);
        self
    }

    pub fn resource(mut self, def: ResourceDef) -> Self {
        self.resources.push(def);
        self
    }

    pub fn resource_template(mut self, def: TemplateDef) -> Self {
        self.templates.push(def);
        self
    }

    pub fn prompt(mut self, def: PromptDef) -> Self {
        self.prompts.push(def);
        self
    }

    /// Completion provider for `ref/resource` or `ref/prompt`.
    pub fn completion_provider(mut self, ref_type: &'static str, provider: CompletionFn) -> Self {
        self.completions.push((ref_type, provider));
        self
    }

    pub fn build(self) -> Result<McpServer, RegistryError> {
        let registry = Arc::new(Registry::new());
        for def in self.tools {
            registry.register_tool(def)?;
        }
        for def in self.resources {
            registry.register_resource(def)?;
        }
        for def in self.templates {
            registry.register_template(def)?;
        }
        for def in self.prompts {
            registry.register_prompt(def)?;
        }
        for (ref_type, provider) in self.completions {
            registry.register_completion_provider(ref_type, provider);
        }

        let server_info = self.server_info.unwrap_or(ServerInfo {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            title: self.title,
            description: self.description,
            website_url: self.website_url,
            icons: self.icons,
        });

        let protocol = ProtocolHandler::new(
            registry,
            ProtocolOptions {
                server_info,
                capabilities: model::ServerCapabilities::advertised(),
                rate_limit_rps: self.config.rate_limit_rps,
                token_validator: self.token_validator,
                strict_initialization: self.config.strict_initialization,
            },
        );

        Ok(McpServer {
            protocol,
            config: self.config,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
