//! Handler registry: tools, resources, resource templates, prompts.
//!
//! Wire representations are computed exactly once at registration: each
//! handler stores its serialized JSON fragment, and list responses are
//! assembled by splicing those cached fragments into the enclosing array
//! without re-serializing item payloads. Mutation goes through
//! [`Registry::invalidate_tool`], which swaps in a freshly computed entry —
//! cached bytes are never edited in place.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::auth::AuthRequirement;
use crate::context::Context;
use crate::error::{HandlerError, RegistryError};
use crate::model::{
    CallToolResult, CompletionArgument, CompletionReference, CompletionValues, Content, Icon,
    JsonObject, Prompt, PromptArgument, PromptMessage, Resource, ResourceContents,
    ResourceTemplate, Tool, ToolAnnotations,
};
use crate::schema::{build_input_schema, ParamSpec};

pub const DEFAULT_PAGE_SIZE: usize = 50;

const TOOL_NAME_MAX_LEN: usize = 128;
/// Minimum similarity for a "did you mean" suggestion.
const SUGGESTION_CUTOFF: f64 = 0.6;

// ============================================================================
// Handler return values
// ============================================================================

/// What a tool handler may produce.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    /// Any serializable value; wrapped as text content (and as
    /// `structuredContent` when the tool declares an output schema).
    Value(Value),
    /// Explicit content blocks.
    Content(Vec<Content>),
    /// A pre-formatted result passed through untouched (modulo `_meta.links`
    /// augmentation). This is the path MCP-Apps view wrappers use.
    Raw(CallToolResult),
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::Value(value)
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Value(Value::String(text))
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Value(Value::String(text.to_owned()))
    }
}

impl From<Vec<Content>> for ToolOutput {
    fn from(content: Vec<Content>) -> Self {
        ToolOutput::Content(content)
    }
}

impl From<CallToolResult> for ToolOutput {
    fn from(result: CallToolResult) -> Self {
        ToolOutput::Raw(result)
    }
}

pub type ToolFn =
    Arc<dyn Fn(JsonObject, Context) -> BoxFuture<'static, Result<ToolOutput, HandlerError>> + Send + Sync>;
pub type ResourceFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<ResourceContents, HandlerError>> + Send + Sync>;
pub type TemplateFn = Arc<
    dyn Fn(HashMap<String, String>, Context) -> BoxFuture<'static, Result<ResourceContents, HandlerError>>
        + Send
        + Sync,
>;
pub type PromptFn = Arc<
    dyn Fn(JsonObject, Context) -> BoxFuture<'static, Result<Vec<PromptMessage>, HandlerError>>
        + Send
        + Sync,
>;
pub type CompletionFn = Arc<
    dyn Fn(CompletionReference, CompletionArgument) -> BoxFuture<'static, Result<CompletionValues, HandlerError>>
        + Send
        + Sync,
>;

// ============================================================================
// Registration definitions (builder-facing)
// ============================================================================

pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    /// Overrides the params-derived schema when set (typed registration).
    pub input_schema: Option<Arc<JsonObject>>,
    pub output_schema: Option<Arc<JsonObject>>,
    pub annotations: ToolAnnotations,
    pub icons: Option<Vec<Icon>>,
    pub website_url: Option<String>,
    pub meta: Option<JsonObject>,
    pub auth: AuthRequirement,
    /// Long-running: calls return a task reference and complete out of band.
    pub task_mode: bool,
    handler: ToolFn,
}

impl ToolDef {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JsonObject, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            params: Vec::new(),
            input_schema: None,
            output_schema: None,
            annotations: ToolAnnotations::default(),
            icons: None,
            website_url: None,
            meta: None,
            auth: AuthRequirement::default(),
            task_mode: false,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = ParamSpec>) -> Self {
        self.params.extend(params);
        self
    }

    /// Derive the input schema from a Rust type instead of a descriptor list.
    pub fn input_schema_for<T: schemars::JsonSchema>(mut self) -> Self {
        self.input_schema = Some(crate::schema::schema_for_type::<T>());
        self
    }

    pub fn output_schema_for<T: schemars::JsonSchema>(mut self) -> Self {
        self.output_schema = Some(crate::schema::schema_for_type::<T>());
        self
    }

    pub fn annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn icons(mut self, icons: Vec<Icon>) -> Self {
        self.icons = Some(icons);
        self
    }

    pub fn website_url(mut self, url: impl Into<String>) -> Self {
        self.website_url = Some(url.into());
        self
    }

    pub fn meta(mut self, meta: JsonObject) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn requires_auth(mut self, scopes: impl IntoIterator<Item = String>) -> Self {
        self.auth = AuthRequirement {
            required: true,
            scopes: scopes.into_iter().collect(),
        };
        self
    }

    pub fn long_running(mut self) -> Self {
        self.task_mode = true;
        self
    }
}

pub struct ResourceDef {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub icons: Option<Vec<Icon>>,
    /// Read-through content cache lifetime.
    pub cache_ttl: Option<Duration>,
    reader: ResourceFn,
}

impl ResourceDef {
    pub fn new<F, Fut>(uri: impl Into<String>, name: impl Into<String>, reader: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceContents, HandlerError>> + Send + 'static,
    {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
            icons: None,
            cache_ttl: None,
            reader: Arc::new(move |ctx| Box::pin(reader(ctx))),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn icons(mut self, icons: Vec<Icon>) -> Self {
        self.icons = Some(icons);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

pub struct TemplateDef {
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub icons: Option<Vec<Icon>>,
    reader: TemplateFn,
}

impl TemplateDef {
    pub fn new<F, Fut>(
        uri_template: impl Into<String>,
        name: impl Into<String>,
        reader: F,
    ) -> Self
    where
        F: Fn(HashMap<String, String>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceContents, HandlerError>> + Send + 'static,
    {
        Self {
            uri_template: uri_template.into(),
            name: name.into(),
            description: None,
            mime_type: None,
            icons: None,
            reader: Arc::new(move |vars, ctx| Box::pin(reader(vars, ctx))),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

pub struct PromptDef {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    renderer: PromptFn,
}

impl PromptDef {
    pub fn new<F, Fut>(name: impl Into<String>, renderer: F) -> Self
    where
        F: Fn(JsonObject, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<PromptMessage>, HandlerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
            renderer: Arc::new(move |args, ctx| Box::pin(renderer(args, ctx))),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn argument(mut self, name: impl Into<String>, required: bool) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: None,
            required: Some(required),
        });
        self
    }
}

// ============================================================================
// Registered entries
// ============================================================================

pub struct RegisteredTool {
    pub tool: Tool,
    pub params: Vec<ParamSpec>,
    pub auth: AuthRequirement,
    pub task_mode: bool,
    pub handler: ToolFn,
    wire: Box<RawValue>,
}

impl RegisteredTool {
    pub fn wire_fragment(&self) -> &RawValue {
        &self.wire
    }

    /// A deep copy of the wire dict; callers may mutate it freely.
    pub fn to_wire_value(&self) -> Value {
        serde_json::from_str(self.wire.get()).unwrap_or(Value::Null)
    }
}

pub struct RegisteredResource {
    pub resource: Resource,
    pub cache_ttl: Option<Duration>,
    pub reader: ResourceFn,
    cache: Mutex<Option<(Instant, ResourceContents)>>,
    wire: Box<RawValue>,
}

impl RegisteredResource {
    pub fn wire_fragment(&self) -> &RawValue {
        &self.wire
    }

    pub fn to_wire_value(&self) -> Value {
        serde_json::from_str(self.wire.get()).unwrap_or(Value::Null)
    }

    pub fn cached_contents(&self) -> Option<ResourceContents> {
        let ttl = self.cache_ttl?;
        let guard = self.cache.lock().unwrap();
        match &*guard {
            Some((at, contents)) if at.elapsed() < ttl => Some(contents.clone()),
            _ => None,
        }
    }

    pub fn store_contents(&self, contents: &ResourceContents) {
        if self.cache_ttl.is_some() {
            *self.cache.lock().unwrap() = Some((Instant::now(), contents.clone()));
        }
    }

    pub fn invalidate_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }
}

pub struct RegisteredTemplate {
    pub template: ResourceTemplate,
    pub reader: TemplateFn,
    wire: Box<RawValue>,
}

impl RegisteredTemplate {
    pub fn wire_fragment(&self) -> &RawValue {
        &self.wire
    }

    /// Bind `uri` against the RFC 6570 level-1 template. Captured variables
    /// never span a `/`.
    pub fn match_uri(&self, uri: &str) -> Option<HashMap<String, String>> {
        match_template(&self.template.uri_template, uri)
    }
}

pub struct RegisteredPrompt {
    pub prompt: Prompt,
    pub renderer: PromptFn,
    wire: Box<RawValue>,
}

impl RegisteredPrompt {
    pub fn wire_fragment(&self) -> &RawValue {
        &self.wire
    }

    pub fn to_wire_value(&self) -> Value {
        serde_json::from_str(self.wire.get()).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Table<T> {
    order: Vec<Arc<T>>,
    index: HashMap<String, usize>,
}

impl<T> Table<T> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn insert(&mut self, key: String, entry: Arc<T>) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.order.len());
        self.order.push(entry);
        true
    }

    fn get(&self, key: &str) -> Option<Arc<T>> {
        self.index.get(key).map(|&i| self.order[i].clone())
    }

    fn replace(&mut self, key: &str, entry: Arc<T>) -> bool {
        match self.index.get(key) {
            Some(&i) => {
                self.order[i] = entry;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &str) -> Option<Arc<T>> {
        let i = self.index.remove(key)?;
        let entry = self.order.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(entry)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<(usize, &String)> =
            self.index.iter().map(|(k, &i)| (i, k)).collect();
        names.sort_by_key(|(i, _)| *i);
        names.into_iter().map(|(_, k)| k.clone()).collect()
    }
}

pub struct Registry {
    tools: RwLock<Table<RegisteredTool>>,
    resources: RwLock<Table<RegisteredResource>>,
    templates: RwLock<Table<RegisteredTemplate>>,
    prompts: RwLock<Table<RegisteredPrompt>>,
    completions: RwLock<HashMap<&'static str, CompletionFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Table::new()),
            resources: RwLock::new(Table::new()),
            templates: RwLock::new(Table::new()),
            prompts: RwLock::new(Table::new()),
            completions: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn register_tool(&self, def: ToolDef) -> Result<(), RegistryError> {
        validate_tool_name(&def.name)?;
        let input_schema = match def.input_schema {
            Some(schema) => schema,
            None => build_input_schema(&def.name, &def.params)?,
        };
        let tool = Tool {
            name: def.name.clone(),
            title: def.annotations.title.clone(),
            description: def.description,
            input_schema,
            output_schema: def.output_schema,
            annotations: (!def.annotations.is_empty()).then_some(def.annotations),
            icons: def.icons,
            website_url: def.website_url,
            meta: def.meta,
        };
        let wire = serialize_fragment(&tool)?;
        let entry = Arc::new(RegisteredTool {
            tool,
            params: def.params,
            auth: def.auth,
            task_mode: def.task_mode,
            handler: def.handler,
            wire,
        });
        let mut tools = self.tools.write().unwrap();
        if !tools.insert(def.name.clone(), entry) {
            return Err(RegistryError::DuplicateName {
                kind: "tool",
                name: def.name,
            });
        }
        tracing::debug!(tool = %def.name, "registered tool");
        Ok(())
    }

    pub fn register_resource(&self, def: ResourceDef) -> Result<(), RegistryError> {
        if def.uri.is_empty() {
            return Err(RegistryError::InvalidName {
                kind: "resource",
                name: def.uri,
                reason: "uri must not be empty",
            });
        }
        let resource = Resource {
            uri: def.uri.clone(),
            name: def.name,
            description: def.description,
            mime_type: def.mime_type,
            icons: def.icons,
        };
        let wire = serialize_fragment(&resource)?;
        let entry = Arc::new(RegisteredResource {
            resource,
            cache_ttl: def.cache_ttl,
            reader: def.reader,
            cache: Mutex::new(None),
            wire,
        });
        let mut resources = self.resources.write().unwrap();
        if !resources.insert(def.uri.clone(), entry) {
            return Err(RegistryError::DuplicateName {
                kind: "resource",
                name: def.uri,
            });
        }
        Ok(())
    }

    pub fn register_template(&self, def: TemplateDef) -> Result<(), RegistryError> {
        if def.uri_template.is_empty() || !def.uri_template.contains('{') {
            return Err(RegistryError::InvalidName {
                kind: "resource template",
                name: def.uri_template,
                reason: "template must contain at least one {variable}",
            });
        }
        let template = ResourceTemplate {
            uri_template: def.uri_template.clone(),
            name: def.name,
            description: def.description,
            mime_type: def.mime_type,
            icons: def.icons,
        };
        let wire = serialize_fragment(&template)?;
        let entry = Arc::new(RegisteredTemplate {
            template,
            reader: def.reader,
            wire,
        });
        let mut templates = self.templates.write().unwrap();
        if !templates.insert(def.uri_template.clone(), entry) {
            return Err(RegistryError::DuplicateName {
                kind: "resource template",
                name: def.uri_template,
            });
        }
        Ok(())
    }

    pub fn register_prompt(&self, def: PromptDef) -> Result<(), RegistryError> {
        if def.name.is_empty() {
            return Err(RegistryError::InvalidName {
                kind: "prompt",
                name: def.name,
                reason: "name must not be empty",
            });
        }
        let prompt = Prompt {
            name: def.name.clone(),
            description: def.description,
            arguments: (!def.arguments.is_empty()).then_some(def.arguments),
        };
        let wire = serialize_fragment(&prompt)?;
        let entry = Arc::new(RegisteredPrompt {
            prompt,
            renderer: def.renderer,
            wire,
        });
        let mut prompts = self.prompts.write().unwrap();
        if !prompts.insert(def.name.clone(), entry) {
            return Err(RegistryError::DuplicateName {
                kind: "prompt",
                name: def.name,
            });
        }
        Ok(())
    }

    pub fn register_completion_provider(&self, ref_type: &'static str, provider: CompletionFn) {
        self.completions.write().unwrap().insert(ref_type, provider);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn tool(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.read().unwrap().get(name)
    }

    pub fn resource(&self, uri: &str) -> Option<Arc<RegisteredResource>> {
        self.resources.read().unwrap().get(uri)
    }

    /// First registered template binding the uri, with its captured
    /// variables.
    pub fn match_template(
        &self,
        uri: &str,
    ) -> Option<(Arc<RegisteredTemplate>, HashMap<String, String>)> {
        let templates = self.templates.read().unwrap();
        templates.order.iter().find_map(|entry| {
            entry
                .match_uri(uri)
                .map(|vars| (entry.clone(), vars))
        })
    }

    pub fn prompt(&self, name: &str) -> Option<Arc<RegisteredPrompt>> {
        self.prompts.read().unwrap().get(name)
    }

    pub fn completion_provider(&self, ref_type: &str) -> Option<CompletionFn> {
        self.completions.read().unwrap().get(ref_type).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().unwrap().names()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.read().unwrap().order.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().unwrap().order.len()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.read().unwrap().order.len()
    }

    /// "did you mean" candidate for an unknown tool name.
    pub fn suggest_tool(&self, name: &str) -> Option<String> {
        closest_match(name, &self.tool_names())
    }

    /// Error message for an unknown tool: a fuzzy suggestion when one
    /// clears the cutoff, otherwise a capped listing of what exists.
    pub fn unknown_tool_message(&self, name: &str) -> String {
        if let Some(suggestion) = self.suggest_tool(name) {
            return format!("Unknown tool: '{name}'. Did you mean '{suggestion}'?");
        }
        let mut names = self.tool_names();
        if names.is_empty() {
            return format!("Unknown tool: '{name}'. No tools are registered.");
        }
        names.sort();
        let suffix = if names.len() > 10 { ", ..." } else { "" };
        names.truncate(10);
        format!(
            "Unknown tool: '{name}'. Available tools: {}{suffix}",
            names.join(", ")
        )
    }

    // ------------------------------------------------------------------
    // Invalidation & deregistration
    // ------------------------------------------------------------------

    /// Recompute a tool's cached schema and wire bytes. The old entry is
    /// replaced wholesale; bytes are never mutated in place.
    pub fn invalidate_tool(&self, name: &str) -> Result<(), RegistryError> {
        let mut tools = self.tools.write().unwrap();
        let entry = tools.get(name).ok_or_else(|| RegistryError::NotFound {
            kind: "tool",
            name: name.to_owned(),
        })?;
        let mut tool = entry.tool.clone();
        if !entry.params.is_empty() {
            tool.input_schema = build_input_schema(name, &entry.params)?;
        }
        let wire = serialize_fragment(&tool)?;
        let fresh = Arc::new(RegisteredTool {
            tool,
            params: entry.params.clone(),
            auth: entry.auth.clone(),
            task_mode: entry.task_mode,
            handler: entry.handler.clone(),
            wire,
        });
        tools.replace(name, fresh);
        Ok(())
    }

    pub fn deregister_tool(&self, name: &str) -> bool {
        self.tools.write().unwrap().remove(name).is_some()
    }

    /// Drop the cached contents of a resource (called when the host reports
    /// an update).
    pub fn invalidate_resource_cache(&self, uri: &str) {
        if let Some(resource) = self.resource(uri) {
            resource.invalidate_cache();
        }
    }

    // ------------------------------------------------------------------
    // List assembly (cached-fragment splicing)
    // ------------------------------------------------------------------

    pub fn list_tools(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Box<RawValue> {
        let tools = self.tools.read().unwrap();
        splice_page("tools", &tools.order, cursor, limit, |t| &t.wire)
    }

    pub fn list_resources(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Box<RawValue> {
        let resources = self.resources.read().unwrap();
        splice_page("resources", &resources.order, cursor, limit, |r| &r.wire)
    }

    pub fn list_templates(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Box<RawValue> {
        let templates = self.templates.read().unwrap();
        splice_page(
            "resourceTemplates",
            &templates.order,
            cursor,
            limit,
            |t| &t.wire,
        )
    }

    pub fn list_prompts(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Box<RawValue> {
        let prompts = self.prompts.read().unwrap();
        splice_page("prompts", &prompts.order, cursor, limit, |p| &p.wire)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_tool_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.len() > TOOL_NAME_MAX_LEN {
        return Err(RegistryError::InvalidName {
            kind: "tool",
            name: name.to_owned(),
            reason: "name must be 1-128 characters",
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(RegistryError::InvalidName {
            kind: "tool",
            name: name.to_owned(),
            reason: "name may only contain [A-Za-z0-9_.-]",
        });
    }
    Ok(())
}

fn serialize_fragment<T: serde::Serialize>(value: &T) -> Result<Box<RawValue>, RegistryError> {
    serde_json::value::to_raw_value(value).map_err(|_| RegistryError::InvalidName {
        kind: "handler",
        name: String::new(),
        reason: "wire representation is not serializable",
    })
}

/// Assemble one page of a list response by splicing cached per-item
/// fragments into the enclosing array.
fn splice_page<T>(
    key: &str,
    items: &[Arc<T>],
    cursor: Option<&str>,
    limit: Option<usize>,
    wire: impl Fn(&T) -> &Box<RawValue>,
) -> Box<RawValue> {
    let offset = cursor.map(decode_cursor).unwrap_or(0);
    let page_size = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let end = offset.saturating_add(page_size).min(items.len());
    let page = if offset < items.len() {
        &items[offset..end]
    } else {
        &[]
    };

    let mut out = String::with_capacity(64 + page.iter().map(|i| wire(i).get().len() + 1).sum::<usize>());
    out.push_str("{\"");
    out.push_str(key);
    out.push_str("\":[");
    for (i, item) in page.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(wire(item).get());
    }
    out.push(']');
    if end < items.len() {
        out.push_str(",\"nextCursor\":\"");
        out.push_str(&encode_cursor(end));
        out.push('"');
    }
    out.push('}');
    RawValue::from_string(out).expect("spliced list is valid JSON")
}

fn encode_cursor(offset: usize) -> String {
    BASE64.encode(offset.to_string())
}

/// Opaque cursor decoding; anything malformed restarts from the beginning.
fn decode_cursor(cursor: &str) -> usize {
    BASE64
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Bind a concrete uri against an RFC 6570 level-1 template. Returns the
/// captured variables, or None when the shapes do not line up.
fn match_template(template: &str, uri: &str) -> Option<HashMap<String, String>> {
    let mut vars = HashMap::new();
    let mut rest = uri;
    let mut segments = template.split('{');

    // Leading literal before the first variable.
    let head = segments.next().unwrap_or("");
    rest = rest.strip_prefix(head)?;

    for segment in segments {
        let (var, literal) = segment.split_once('}')?;
        let capture_end = if literal.is_empty() {
            rest.len()
        } else {
            rest.find(literal)?
        };
        let captured = &rest[..capture_end];
        if captured.is_empty() || captured.contains('/') {
            return None;
        }
        vars.insert(var.to_owned(), captured.to_owned());
        rest = &rest[capture_end + literal.len()..];
    }

    rest.is_empty().then_some(vars)
}

/// Normalized edit-distance similarity in [0, 1].
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Closest candidate at or above the suggestion cutoff.
fn closest_match(name: &str, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .map(|candidate| (similarity(name, candidate), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_CUTOFF)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, candidate)| candidate.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool(name: &str) -> ToolDef {
        ToolDef::new(name, |args, _ctx| async move {
            Ok(ToolOutput::Value(Value::Object(args)))
        })
        .description("echoes its arguments")
        .param(ParamSpec::string("text"))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("echo")).unwrap();
        let tool = registry.tool("echo").unwrap();
        assert_eq!(tool.tool.name, "echo");
        assert!(registry.tool("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("echo")).unwrap();
        let err = registry.register_tool(echo_tool("echo")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn test_invalid_tool_names_rejected() {
        let registry = Registry::new();
        for bad in ["", "has space", "emoji🙂", &"x".repeat(129)] {
            let err = registry.register_tool(echo_tool(bad)).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName { .. }), "{bad:?}");
        }
        registry.register_tool(echo_tool("ok-name.v2_final")).unwrap();
    }

    #[test]
    fn test_wire_bytes_are_stable_until_invalidation() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("echo")).unwrap();
        let first = registry.tool("echo").unwrap().wire_fragment().get().to_owned();
        let second = registry.tool("echo").unwrap().wire_fragment().get().to_owned();
        assert_eq!(first, second);

        registry.invalidate_tool("echo").unwrap();
        let third = registry.tool("echo").unwrap().wire_fragment().get().to_owned();
        // Recomputed from the same definition, so equal content, but the
        // entry was rebuilt rather than edited.
        assert_eq!(first, third);
    }

    #[test]
    fn test_wire_value_is_a_deep_copy() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("echo")).unwrap();
        let tool = registry.tool("echo").unwrap();
        let mut copy = tool.to_wire_value();
        copy["name"] = Value::String("mutated".into());
        assert_eq!(tool.to_wire_value()["name"], "echo");
    }

    #[test]
    fn test_list_pagination_round_trip() {
        let registry = Registry::new();
        for i in 0..7 {
            registry.register_tool(echo_tool(&format!("tool_{i}"))).unwrap();
        }
        let page1: Value =
            serde_json::from_str(registry.list_tools(None, Some(3)).get()).unwrap();
        assert_eq!(page1["tools"].as_array().unwrap().len(), 3);
        assert_eq!(page1["tools"][0]["name"], "tool_0");
        let cursor = page1["nextCursor"].as_str().unwrap().to_owned();

        let page2: Value =
            serde_json::from_str(registry.list_tools(Some(&cursor), Some(3)).get()).unwrap();
        assert_eq!(page2["tools"][0]["name"], "tool_3");

        let cursor2 = page2["nextCursor"].as_str().unwrap().to_owned();
        let page3: Value =
            serde_json::from_str(registry.list_tools(Some(&cursor2), Some(3)).get()).unwrap();
        assert_eq!(page3["tools"].as_array().unwrap().len(), 1);
        assert!(page3.get("nextCursor").is_none());
    }

    #[test]
    fn test_invalid_cursor_restarts() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("only")).unwrap();
        let page: Value =
            serde_json::from_str(registry.list_tools(Some("!!garbage!!"), None).get()).unwrap();
        assert_eq!(page["tools"][0]["name"], "only");
    }

    #[test]
    fn test_fuzzy_suggestion() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("add_numbers")).unwrap();
        registry.register_tool(echo_tool("subtract")).unwrap();
        assert_eq!(
            registry.suggest_tool("add_numers"),
            Some("add_numbers".to_owned())
        );
        assert!(registry
            .unknown_tool_message("add_numers")
            .contains("add_numbers"));
        // Far from everything: falls back to listing.
        assert!(registry
            .unknown_tool_message("zzzzzzzzzzz")
            .contains("Available tools"));
    }

    #[test]
    fn test_template_matching() {
        assert_eq!(
            match_template("file:///{path}", "file:///notes.txt")
                .unwrap()
                .get("path")
                .unwrap(),
            "notes.txt"
        );
        let vars =
            match_template("db://{table}/{id}", "db://users/42").unwrap();
        assert_eq!(vars["table"], "users");
        assert_eq!(vars["id"], "42");
        // Captures never span a segment.
        assert!(match_template("file:///{path}", "file:///a/b").is_none());
        assert!(match_template("db://{table}/{id}", "db://users").is_none());
    }

    #[test]
    fn test_registry_template_lookup() {
        let registry = Registry::new();
        registry
            .register_template(TemplateDef::new(
                "config://{section}",
                "config-section",
                |vars, _ctx| async move {
                    Ok(ResourceContents::text(
                        format!("config://{}", vars["section"]),
                        None,
                        "{}",
                    ))
                },
            ))
            .unwrap();
        let (entry, vars) = registry.match_template("config://network").unwrap();
        assert_eq!(entry.template.name, "config-section");
        assert_eq!(vars["section"], "network");
        assert!(registry.match_template("other://x").is_none());
    }

    #[test]
    fn test_resource_cache_ttl() {
        let registry = Registry::new();
        registry
            .register_resource(
                ResourceDef::new("config://app", "app", |_ctx| async move {
                    Ok(ResourceContents::text("config://app", None, "v1"))
                })
                .cache_ttl(Duration::from_secs(60)),
            )
            .unwrap();
        let resource = registry.resource("config://app").unwrap();
        assert!(resource.cached_contents().is_none());
        let contents = ResourceContents::text("config://app", None, "v1");
        resource.store_contents(&contents);
        assert_eq!(resource.cached_contents(), Some(contents));
        registry.invalidate_resource_cache("config://app");
        assert!(resource.cached_contents().is_none());
    }

    #[test]
    fn test_similarity_cutoff() {
        assert!(similarity("add_numbers", "add_numers") > 0.9);
        assert!(similarity("add", "remove") < 0.6);
    }

    #[test]
    fn test_deregister_then_reuse_name() {
        let registry = Registry::new();
        registry.register_tool(echo_tool("a")).unwrap();
        registry.register_tool(echo_tool("b")).unwrap();
        assert!(registry.deregister_tool("a"));
        assert!(!registry.deregister_tool("a"));
        // Index stays consistent after removal.
        assert_eq!(registry.tool("b").unwrap().tool.name, "b");
        registry.register_tool(echo_tool("a")).unwrap();
        assert_eq!(registry.tool_names(), vec!["b", "a"]);
    }
}
