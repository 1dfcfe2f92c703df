//! Input-schema conversion
//!
//! Turns the declarative JSON schema a backend advertises for a tool into a
//! [`Validator`] tree that checks call arguments before they are routed.
//! Supported: `object` (with `properties` / `required`), `string`, `number`,
//! `integer`, `boolean`, `null`, `array` (with `items`), `enum`, and
//! nullability via `"nullable": true` or a `["<type>", "null"]` type list.
//! Anything else accepts any value.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::UnknownFields;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub validator: Validator,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValidator {
    pub fields: Vec<Field>,
    /// Applies to this object only; nested objects always pass extras through
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Null,
    Enum(Vec<Value>),
    Array(Box<Validator>),
    Object(ObjectValidator),
    Nullable(Box<Validator>),
}

/// Convert a tool's top-level input schema.
pub fn convert(schema: &Value, unknown: UnknownFields) -> Validator {
    convert_node(schema, unknown)
}

fn convert_node(schema: &Value, unknown: UnknownFields) -> Validator {
    let Some(node) = schema.as_object() else {
        return Validator::Any;
    };

    let (type_name, mut nullable) = declared_type(node);
    if node.get("nullable").and_then(Value::as_bool).unwrap_or(false) {
        nullable = true;
    }

    let base = match node.get("enum").and_then(Value::as_array) {
        Some(values) => Validator::Enum(values.iter().filter(|v| !v.is_null()).cloned().collect()),
        None => match type_name.as_deref() {
            Some("object") => Validator::Object(convert_object(node, unknown)),
            Some("array") => Validator::Array(Box::new(
                node.get("items")
                    .map(|items| convert_node(items, UnknownFields::Passthrough))
                    .unwrap_or(Validator::Any),
            )),
            Some("string") => Validator::String,
            Some("number") => Validator::Number,
            Some("integer") => Validator::Integer,
            Some("boolean") => Validator::Boolean,
            Some("null") => Validator::Null,
            _ => Validator::Any,
        },
    };

    let enum_allows_null = node
        .get("enum")
        .and_then(Value::as_array)
        .map(|values| values.iter().any(Value::is_null))
        .unwrap_or(false);

    if (nullable || enum_allows_null) && !matches!(base, Validator::Any | Validator::Null) {
        Validator::Nullable(Box::new(base))
    } else {
        base
    }
}

/// The single non-null type, inferred from shape when `type` is absent.
/// A type that only admits null is reported as `null`.
fn declared_type(node: &Map<String, Value>) -> (Option<String>, bool) {
    match node.get("type") {
        Some(Value::String(name)) => (Some(name.clone()), name == "null"),
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            let nullable = names.contains(&"null");
            let concrete: Vec<&str> = names.into_iter().filter(|n| *n != "null").collect();
            match concrete.as_slice() {
                [single] => (Some(single.to_string()), nullable),
                [] if nullable => (Some("null".to_string()), true),
                _ => (None, nullable),
            }
        }
        _ if node.contains_key("properties") => (Some("object".to_string()), false),
        _ if node.contains_key("items") => (Some("array".to_string()), false),
        _ => (None, false),
    }
}

fn convert_object(node: &Map<String, Value>, unknown: UnknownFields) -> ObjectValidator {
    let required: Vec<&str> = node
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let fields = node
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, schema)| Field {
                    name: name.clone(),
                    validator: convert_node(schema, UnknownFields::Passthrough),
                    required: required.contains(&name.as_str()),
                })
                .collect()
        })
        .unwrap_or_default();

    ObjectValidator { fields, unknown }
}

impl Validator {
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.check(value, "$")
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        let fail = |message: String| {
            Err(SchemaViolation {
                path: path.to_string(),
                message,
            })
        };

        match self {
            Validator::Any => Ok(()),
            Validator::Nullable(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.check(value, path)
                }
            }
            Validator::String if value.is_string() => Ok(()),
            Validator::Number if value.is_number() => Ok(()),
            Validator::Integer if is_integer(value) => Ok(()),
            Validator::Boolean if value.is_boolean() => Ok(()),
            Validator::Null if value.is_null() => Ok(()),
            Validator::String => fail(format!("expected string, got {}", kind(value))),
            Validator::Number => fail(format!("expected number, got {}", kind(value))),
            Validator::Integer => fail(format!("expected integer, got {}", kind(value))),
            Validator::Boolean => fail(format!("expected boolean, got {}", kind(value))),
            Validator::Null => fail(format!("expected null, got {}", kind(value))),
            Validator::Enum(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    fail(format!("{} is not one of {}", value, Value::Array(allowed.clone())))
                }
            }
            Validator::Array(items) => match value.as_array() {
                Some(elements) => elements
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, element)| items.check(element, &format!("{}[{}]", path, i))),
                None => fail(format!("expected array, got {}", kind(value))),
            },
            Validator::Object(object) => match value.as_object() {
                Some(map) => object.check(map, path),
                None => fail(format!("expected object, got {}", kind(value))),
            },
        }
    }
}

impl ObjectValidator {
    fn check(&self, map: &Map<String, Value>, path: &str) -> Result<(), SchemaViolation> {
        for field in &self.fields {
            let field_path = format!("{}.{}", path, field.name);
            match map.get(&field.name) {
                Some(value) => field.validator.check(value, &field_path)?,
                None if field.required => {
                    return Err(SchemaViolation {
                        path: field_path,
                        message: "required field is missing".to_string(),
                    })
                }
                None => {}
            }
        }

        if self.unknown == UnknownFields::Reject {
            if let Some(extra) = map
                .keys()
                .find(|key| !self.fields.iter().any(|f| &f.name == *key))
            {
                return Err(SchemaViolation {
                    path: format!("{}.{}", path, extra),
                    message: "unknown field".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn is_integer(value: &Value) -> bool {
    value.is_i64()
        || value.is_u64()
        || value.as_f64().map(|f| f.is_finite() && f.fract() == 0.0).unwrap_or(false)
}

fn kind(value: &Value) -> &'static str {
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
    use serde_json::json;

    fn greeting_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "times": { "type": "integer" },
                "loud": { "type": "boolean" }
            },
            "required": ["name"]
        })
    }

    #[test]
    fn test_required_and_optional_fields() {
        let validator = convert(&greeting_schema(), UnknownFields::Passthrough);
        assert!(validator.validate(&json!({"name": "ada"})).is_ok());
        assert!(validator.validate(&json!({"name": "ada", "times": 2, "loud": true})).is_ok());

        let err = validator.validate(&json!({"times": 2})).unwrap_err();
        assert_eq!(err.path, "$.name");
    }

    #[test]
    fn test_type_mismatch_reports_path() {
        let validator = convert(&greeting_schema(), UnknownFields::Passthrough);
        let err = validator.validate(&json!({"name": "a", "times": 1.5})).unwrap_err();
        assert_eq!(err.path, "$.times");
        assert!(err.message.contains("expected integer"));
    }

    #[test]
    fn test_unknown_fields_policy() {
        let args = json!({"name": "ada", "extra": 1});
        assert!(convert(&greeting_schema(), UnknownFields::Passthrough)
            .validate(&args)
            .is_ok());
        let err = convert(&greeting_schema(), UnknownFields::Reject)
            .validate(&args)
            .unwrap_err();
        assert_eq!(err.path, "$.extra");
    }

    #[test]
    fn test_nested_objects_and_arrays() {
        let schema = json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "id": { "type": "integer" }, "tag": { "type": "string" } },
                        "required": ["id"]
                    }
                }
            },
            "required": ["items"]
        });
        let validator = convert(&schema, UnknownFields::Reject);
        assert!(validator
            .validate(&json!({"items": [{"id": 1}, {"id": 2, "tag": "x", "other": true}]}))
            .is_ok());

        let err = validator
            .validate(&json!({"items": [{"id": 1}, {"tag": "x"}]}))
            .unwrap_err();
        assert_eq!(err.path, "$.items[1].id");
    }

    #[test]
    fn test_nullable_forms() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": { "type": "string", "nullable": true },
                "b": { "type": ["number", "null"] },
                "c": { "type": "string" }
            }
        });
        let validator = convert(&schema, UnknownFields::Passthrough);
        assert!(validator.validate(&json!({"a": null, "b": null})).is_ok());
        assert!(validator.validate(&json!({"c": null})).is_err());
    }

    #[test]
    fn test_null_type_accepts_only_null() {
        for schema in [json!({"type": "null"}), json!({"type": ["null"]})] {
            let validator = convert(&schema, UnknownFields::Passthrough);
            assert_eq!(validator, Validator::Null);
            assert!(validator.validate(&Value::Null).is_ok());
            let err = validator.validate(&json!("x")).unwrap_err();
            assert_eq!(err.message, "expected null, got string");
        }

        let object = json!({
            "type": "object",
            "properties": {"cleared": {"type": "null"}}
        });
        let validator = convert(&object, UnknownFields::Passthrough);
        assert!(validator.validate(&json!({"cleared": null})).is_ok());
        assert!(validator.validate(&json!({"cleared": 0})).is_err());
    }

    #[test]
    fn test_enum() {
        let schema = json!({"type": "string", "enum": ["red", "green"]});
        let validator = convert(&schema, UnknownFields::Passthrough);
        assert!(validator.validate(&json!("red")).is_ok());
        assert!(validator.validate(&json!("blue")).is_err());
    }

    #[test]
    fn test_shape_inference_and_fallbacks() {
        assert!(matches!(
            convert(&json!({"properties": {}}), UnknownFields::Passthrough),
            Validator::Object(_)
        ));
        assert_eq!(convert(&json!({}), UnknownFields::Passthrough), Validator::Any);
        assert_eq!(convert(&json!(true), UnknownFields::Passthrough), Validator::Any);
        assert_eq!(
            convert(&json!({"type": ["string", "number"]}), UnknownFields::Passthrough),
            Validator::Any
        );
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        assert!(Validator::Integer.validate(&json!(3.0)).is_ok());
        assert!(Validator::Integer.validate(&json!(-4)).is_ok());
        assert!(Validator::Integer.validate(&json!("3")).is_err());
    }
}
