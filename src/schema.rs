//! JSON Schema derivation for handler parameters.
//!
//! Handlers declare their signature as a list of [`ParamSpec`] descriptors;
//! the registry turns that list into the `inputSchema` object exactly once at
//! registration. Structured record parameters come in through `schemars` via
//! [`schema_for_type`], which also covers recursive types (`$defs`).

use std::sync::Arc;

use serde_json::Value;

use crate::error::RegistryError;
use crate::model::JsonObject;

/// The JSON Schema type of a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    /// Ordered sequence with a typed item.
    Array(Box<ParamKind>),
    /// Free-form mapping.
    Object,
    /// Closed string enumeration.
    Enum(Vec<String>),
    /// A structured record schema, typically produced by [`schema_for_type`].
    Typed(Arc<JsonObject>),
}

impl ParamKind {
    fn schema(&self) -> Value {
        match self {
            ParamKind::String => serde_json::json!({"type": "string"}),
            ParamKind::Integer => serde_json::json!({"type": "integer"}),
            ParamKind::Number => serde_json::json!({"type": "number"}),
            ParamKind::Boolean => serde_json::json!({"type": "boolean"}),
            ParamKind::Array(item) => serde_json::json!({"type": "array", "items": item.schema()}),
            ParamKind::Object => serde_json::json!({"type": "object"}),
            ParamKind::Enum(values) => serde_json::json!({"type": "string", "enum": values}),
            ParamKind::Typed(schema) => Value::Object(schema.as_ref().clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamKind::String | ParamKind::Enum(_) => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array(_) => "array",
            ParamKind::Object | ParamKind::Typed(_) => "object",
        }
    }
}

/// One declared handler parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: Option<String>,
    /// Optional parameters are dropped from `required` and may default.
    pub optional: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            optional: false,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn array(name: impl Into<String>, item: ParamKind) -> Self {
        Self::new(name, ParamKind::Array(Box::new(item)))
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Object)
    }

    pub fn enumeration<S: Into<String>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            ParamKind::Enum(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.optional = true;
        self
    }

    /// The schema fragment for this parameter alone. Used both in the input
    /// schema and in missing-argument error payloads.
    pub fn schema_fragment(&self) -> Value {
        let mut fragment = self.kind.schema();
        if let Some(description) = &self.description {
            fragment["description"] = Value::String(description.clone());
        }
        if let Some(default) = &self.default {
            fragment["default"] = default.clone();
        }
        fragment
    }
}

/// Build the `inputSchema` object for a parameter list.
pub fn build_input_schema(
    owner: &str,
    params: &[ParamSpec],
) -> Result<Arc<JsonObject>, RegistryError> {
    let mut properties = JsonObject::new();
    let mut required = Vec::new();

    for param in params {
        if param.name.is_empty() {
            return Err(RegistryError::UnsupportedParameterType {
                name: owner.to_owned(),
                param: param.name.clone(),
                reason: "parameter name must not be empty",
            });
        }
        if let ParamKind::Enum(values) = &param.kind {
            if values.is_empty() {
                return Err(RegistryError::UnsupportedParameterType {
                    name: owner.to_owned(),
                    param: param.name.clone(),
                    reason: "enum must declare at least one value",
                });
            }
        }
        if properties
            .insert(param.name.clone(), param.schema_fragment())
            .is_some()
        {
            return Err(RegistryError::UnsupportedParameterType {
                name: owner.to_owned(),
                param: param.name.clone(),
                reason: "duplicate parameter name",
            });
        }
        if !param.optional {
            required.push(Value::String(param.name.clone()));
        }
    }

    let mut schema = JsonObject::new();
    schema.insert("type".to_owned(), Value::String("object".to_owned()));
    schema.insert("properties".to_owned(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_owned(), Value::Array(required));
    }
    Ok(Arc::new(schema))
}

/// Generate an object schema from a Rust type via `schemars`. Recursive types
/// produce `$defs` inline, satisfying the nested-record mapping rule.
pub fn schema_for_type<T: schemars::JsonSchema>() -> Arc<JsonObject> {
    let schema = schemars::schema_for!(T);
    let value = serde_json::to_value(schema).unwrap_or(Value::Null);
    match value {
        Value::Object(mut object) => {
            // The wire schema carries no meta-schema reference.
            object.remove("$schema");
            object.remove("title");
            Arc::new(object)
        }
        _ => Arc::new(JsonObject::new()),
    }
}

/// Coercion failure, reported with the parameter name so clients can
/// self-correct.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("parameter {param:?}: expected {expected}, got {actual}")]
pub struct ParameterValidationError {
    pub param: String,
    pub expected: &'static str,
    pub actual: String,
}

/// Coerce one argument value toward its declared kind. Lossless conversions
/// only: numeric strings parse, integral floats narrow, anything else is a
/// mismatch.
pub fn coerce_value(param: &ParamSpec, value: Value) -> Result<Value, ParameterValidationError> {
    let mismatch = |actual: &Value| ParameterValidationError {
        param: param.name.clone(),
        expected: param.kind.type_name(),
        actual: type_of(actual).to_owned(),
    };

    match &param.kind {
        ParamKind::String => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ParamKind::Integer => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err(mismatch(&value)),
            },
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        ParamKind::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        ParamKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        ParamKind::Array(item) => match value {
            Value::Array(values) => {
                let item_spec = ParamSpec::new(param.name.clone(), (**item).clone());
                values
                    .into_iter()
                    .map(|v| coerce_value(&item_spec, v))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            other => Err(mismatch(&other)),
        },
        ParamKind::Object | ParamKind::Typed(_) => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ParamKind::Enum(values) => match &value {
            Value::String(s) if values.contains(s) => Ok(value),
            _ => Err(ParameterValidationError {
                param: param.name.clone(),
                expected: "string (enum)",
                actual: type_of(&value).to_owned(),
            }),
        },
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_schema_mapping() {
        let schema = build_input_schema(
            "add",
            &[ParamSpec::integer("a"), ParamSpec::integer("b")],
        )
        .unwrap();
        let value = Value::Object(schema.as_ref().clone());
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["a"]["type"], "integer");
        assert_eq!(
            value["required"],
            serde_json::json!(["a", "b"])
        );
    }

    #[test]
    fn test_optional_param_not_required() {
        let schema = build_input_schema(
            "search",
            &[
                ParamSpec::string("query"),
                ParamSpec::integer("limit").with_default(serde_json::json!(10)),
            ],
        )
        .unwrap();
        let value = Value::Object(schema.as_ref().clone());
        assert_eq!(value["required"], serde_json::json!(["query"]));
        assert_eq!(value["properties"]["limit"]["default"], 10);
    }

    #[test]
    fn test_array_and_enum_schemas() {
        let schema = build_input_schema(
            "filter",
            &[
                ParamSpec::array("tags", ParamKind::String),
                ParamSpec::enumeration("mode", ["any", "all"]),
            ],
        )
        .unwrap();
        let value = Value::Object(schema.as_ref().clone());
        assert_eq!(value["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(
            value["properties"]["mode"]["enum"],
            serde_json::json!(["any", "all"])
        );
    }

    #[test]
    fn test_empty_enum_rejected() {
        let err = build_input_schema(
            "bad",
            &[ParamSpec::enumeration("mode", Vec::<String>::new())],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnsupportedParameterType { .. }
        ));
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let err = build_input_schema(
            "bad",
            &[ParamSpec::string("x"), ParamSpec::integer("x")],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnsupportedParameterType { .. }
        ));
    }

    #[test]
    fn test_coerce_integer_from_string() {
        let param = ParamSpec::integer("n");
        assert_eq!(
            coerce_value(&param, Value::String("42".into())).unwrap(),
            Value::from(42)
        );
        assert_eq!(
            coerce_value(&param, serde_json::json!(3.0)).unwrap(),
            Value::from(3)
        );
        let err = coerce_value(&param, serde_json::json!(3.5)).unwrap_err();
        assert_eq!(err.param, "n");
        assert_eq!(err.expected, "integer");
    }

    #[test]
    fn test_coerce_bool_and_enum() {
        let flag = ParamSpec::boolean("flag");
        assert_eq!(
            coerce_value(&flag, Value::String("true".into())).unwrap(),
            Value::Bool(true)
        );
        let mode = ParamSpec::enumeration("mode", ["fast", "slow"]);
        assert!(coerce_value(&mode, Value::String("fast".into())).is_ok());
        assert!(coerce_value(&mode, Value::String("medium".into())).is_err());
    }

    #[test]
    fn test_coerce_array_items() {
        let param = ParamSpec::array("ns", ParamKind::Integer);
        let coerced =
            coerce_value(&param, serde_json::json!(["1", 2, 3.0])).unwrap();
        assert_eq!(coerced, serde_json::json!([1, 2, 3]));
        assert!(coerce_value(&param, serde_json::json!(["a"])).is_err());
    }

    #[test]
    fn test_schema_for_type_strips_meta() {
        #[derive(schemars::JsonSchema)]
        #[allow(dead_code)]
        struct Point {
            x: f64,
            y: f64,
        }
        let schema = schema_for_type::<Point>();
        assert!(!schema.contains_key("$schema"));
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].get("x").is_some());
    }
}
