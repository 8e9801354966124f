use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::JsonObject;

/// A tool as it appears in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Arc<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Arc<JsonObject>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icons: Option<Vec<Icon>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    /// Free-form passthrough (enables MCP-Apps `_meta.ui.resourceUri`).
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonObject>,
}

/// Behavioral hints attached to a tool. All hints are advisory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

impl ToolAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(self, read_only: bool) -> Self {
        Self {
            read_only_hint: Some(read_only),
            ..self
        }
    }

    pub fn destructive(self, destructive: bool) -> Self {
        Self {
            destructive_hint: Some(destructive),
            ..self
        }
    }

    pub fn idempotent(self, idempotent: bool) -> Self {
        Self {
            idempotent_hint: Some(idempotent),
            ..self
        }
    }

    pub fn open_world(self, open_world: bool) -> Self {
        Self {
            open_world_hint: Some(open_world),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.read_only_hint.is_none()
            && self.destructive_hint.is_none()
            && self.idempotent_hint.is_none()
            && self.open_world_hint.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_schema() -> Arc<JsonObject> {
        Arc::new(
            serde_json::json!({"type": "object", "properties": {}})
                .as_object()
                .unwrap()
                .clone(),
        )
    }

    #[test]
    fn test_tool_serialization_camel_case() {
        let tool = Tool {
            name: "add".into(),
            title: None,
            description: Some("Add two numbers".into()),
            input_schema: object_schema(),
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            icons: None,
            website_url: None,
            meta: None,
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["inputSchema"]["type"], "object");
        assert_eq!(json["annotations"]["readOnlyHint"], true);
        assert!(json.get("outputSchema").is_none());
    }

    #[test]
    fn test_tool_meta_passthrough() {
        let mut meta = JsonObject::new();
        meta.insert(
            "ui".into(),
            serde_json::json!({"resourceUri": "ui://panel/main"}),
        );
        let tool = Tool {
            name: "panel".into(),
            title: None,
            description: None,
            input_schema: object_schema(),
            output_schema: None,
            annotations: None,
            icons: None,
            website_url: None,
            meta: Some(meta),
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["_meta"]["ui"]["resourceUri"], "ui://panel/main");
    }

    #[test]
    fn test_annotations_builder_chaining() {
        let annotations = ToolAnnotations::new()
            .read_only(true)
            .destructive(false)
            .idempotent(true)
            .open_world(false);
        assert_eq!(annotations.read_only_hint, Some(true));
        assert_eq!(annotations.destructive_hint, Some(false));
        assert_eq!(annotations.idempotent_hint, Some(true));
        assert_eq!(annotations.open_world_hint, Some(false));
        assert!(!annotations.is_empty());
        assert!(ToolAnnotations::new().is_empty());
    }
}
