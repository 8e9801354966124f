use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JsonObject;

/// A single content block inside a tool result or prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Content {
    #[serde(rename_all = "camelCase")]
    Text { text: String },
    #[serde(rename_all = "camelCase")]
    Image { data: String, mime_type: String },
    #[serde(rename_all = "camelCase")]
    Resource {
        resource: super::ResourceContents,
    },
    #[serde(rename_all = "camelCase")]
    ResourceLink {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A resource link accumulated during a tool call via the context API and
/// attached to the result under `_meta.links`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLink {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The wire result of `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonObject>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        CallToolResult {
            content: vec![Content::text(text)],
            ..Default::default()
        }
    }

    /// Attach accumulated resource links under `_meta.links`.
    pub fn attach_links(&mut self, links: Vec<ResourceLink>) {
        if links.is_empty() {
            return;
        }
        let meta = self.meta.get_or_insert_with(JsonObject::new);
        meta.insert(
            "links".to_owned(),
            serde_json::to_value(links).unwrap_or(Value::Null),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_wire_shape() {
        let content = Content::text("hello");
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hello"}));
    }

    #[test]
    fn test_image_content_uses_camel_case() {
        let content = Content::Image {
            data: "aGk=".into(),
            mime_type: "image/png".into(),
        };
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains("mimeType"));
        assert!(!json.contains("mime_type"));
    }

    #[test]
    fn test_call_tool_result_meta_key() {
        let mut result = CallToolResult::text("done");
        result.attach_links(vec![ResourceLink {
            uri: "file:///report.csv".into(),
            name: Some("report".into()),
            description: None,
            mime_type: Some("text/csv".into()),
        }]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["_meta"]["links"][0]["uri"], "file:///report.csv");
        assert!(json.get("structuredContent").is_none());
    }

    #[test]
    fn test_attach_empty_links_leaves_meta_absent() {
        let mut result = CallToolResult::text("done");
        result.attach_links(vec![]);
        assert!(result.meta.is_none());
    }
}
