//! Strict JSON projection of values and documents.
//!
//! This is both the human-readable debug format and the storage format in the
//! `_jsonb` column. Objects carry an explicit `$k` key list because jsonb does not
//! keep key order.

use serde_json::{Map, Value as JsonValue};

use super::binary::Scalar;
use super::document::Document;
use super::scalars::{Binary, DateTime, ObjectId, Regex, Timestamp};
use super::value::Value;

const KEYS_FIELD: &str = "$k";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonError {
    #[error("invalid JSON: {0}")]
    Syntax(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unexpected null for {0}")]
    UnexpectedNull(&'static str),

    #[error("invalid value {0:?}")]
    InvalidValue(String),

    #[error("key {0:?} has no JSON projection")]
    ReservedKey(String),
}

pub(crate) fn json_type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Checks that `json` is an object with exactly `fields`.
pub(crate) fn expect_wrapper<'a>(
    json: &'a JsonValue,
    name: &'static str,
    fields: &[&str],
) -> Result<&'a Map<String, JsonValue>, JsonError> {
    let map = match json {
        JsonValue::Object(map) => map,
        JsonValue::Null => return Err(JsonError::UnexpectedNull(name)),
        other => {
            return Err(JsonError::TypeMismatch {
                expected: name,
                found: json_type_name(other),
            });
        }
    };
    if let Some(unknown) = map.keys().find(|k| !fields.contains(&k.as_str())) {
        return Err(JsonError::SchemaViolation(format!(
            "unknown field {unknown:?} in {name}"
        )));
    }
    if let Some(missing) = fields.iter().find(|f| !map.contains_key(**f)) {
        return Err(JsonError::SchemaViolation(format!(
            "missing field {missing:?} in {name}"
        )));
    }
    Ok(map)
}

impl Value {
    pub fn to_json(&self) -> Result<JsonValue, JsonError> {
        let json = match self {
            Value::Double(v) => v.to_json(),
            Value::String(v) => v.to_json(),
            Value::Document(d) => d.to_json()?,
            Value::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Binary(v) => v.to_json(),
            Value::ObjectId(v) => v.to_json(),
            Value::Bool(v) => v.to_json(),
            Value::DateTime(v) => v.to_json(),
            Value::Null => JsonValue::Null,
            Value::Regex(v) => v.to_json(),
            Value::Int32(v) => v.to_json(),
            Value::Timestamp(v) => v.to_json(),
            Value::Int64(v) => v.to_json(),
        };
        Ok(json)
    }

    pub fn from_json(json: &JsonValue) -> Result<Value, JsonError> {
        let value = match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(_) => Value::Int32(i32::from_json(json)?),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(map) => {
                if map.contains_key(KEYS_FIELD) {
                    return Document::from_json(json).map(Value::Document);
                }
                if map.contains_key("$f") {
                    Value::Double(f64::from_json(json)?)
                } else if map.contains_key("$l") {
                    Value::Int64(i64::from_json(json)?)
                } else if map.contains_key("$o") {
                    Value::ObjectId(ObjectId::from_json(json)?)
                } else if map.contains_key("$b") {
                    Value::Binary(Binary::from_json(json)?)
                } else if map.contains_key("$d") {
                    Value::DateTime(DateTime::from_json(json)?)
                } else if map.contains_key("$t") {
                    Value::Timestamp(Timestamp::from_json(json)?)
                } else if map.contains_key("$r") {
                    Value::Regex(Regex::from_json(json)?)
                } else {
                    let fields: Vec<&str> = map.keys().map(String::as_str).collect();
                    return Err(JsonError::SchemaViolation(format!(
                        "unrecognized object with fields {fields:?}"
                    )));
                }
            }
        };
        Ok(value)
    }

    pub fn from_json_str(s: &str) -> Result<Value, JsonError> {
        let json: JsonValue =
            serde_json::from_str(s).map_err(|e| JsonError::Syntax(e.to_string()))?;
        Value::from_json(&json)
    }
}

impl Document {
    pub fn to_json(&self) -> Result<JsonValue, JsonError> {
        let mut map = Map::with_capacity(self.len() + 1);
        let mut keys = Vec::with_capacity(self.len());
        for (k, v) in self.iter() {
            if k == KEYS_FIELD {
                return Err(JsonError::ReservedKey(k.to_string()));
            }
            keys.push(JsonValue::String(k.to_string()));
            map.insert(k.to_string(), v.to_json()?);
        }
        map.insert(KEYS_FIELD.to_string(), JsonValue::Array(keys));
        Ok(JsonValue::Object(map))
    }

    pub fn from_json(json: &JsonValue) -> Result<Document, JsonError> {
        let map = match json {
            JsonValue::Object(map) => map,
            JsonValue::Null => return Err(JsonError::UnexpectedNull("document")),
            other => {
                return Err(JsonError::TypeMismatch {
                    expected: "document",
                    found: json_type_name(other),
                });
            }
        };
        let keys = match map.get(KEYS_FIELD) {
            Some(JsonValue::Array(keys)) => keys,
            Some(other) => {
                return Err(JsonError::TypeMismatch {
                    expected: "array",
                    found: json_type_name(other),
                });
            }
            None => {
                return Err(JsonError::SchemaViolation(
                    "missing field \"$k\" in document".to_string(),
                ));
            }
        };

        let mut doc = Document::with_capacity(keys.len());
        for key in keys {
            let key = match key {
                JsonValue::String(k) => k,
                other => {
                    return Err(JsonError::TypeMismatch {
                        expected: "string",
                        found: json_type_name(other),
                    });
                }
            };
            if key.contains('\0') {
                return Err(JsonError::InvalidValue(key.clone()));
            }
            let value = map.get(key).ok_or_else(|| {
                JsonError::SchemaViolation(format!("missing field {key:?} in document"))
            })?;
            doc.try_push(key.clone(), Value::from_json(value)?)
                .map_err(|e| JsonError::SchemaViolation(e.to_string()))?;
        }

        if map.len() != doc.len() + 1 {
            let unknown = map
                .keys()
                .find(|k| k.as_str() != KEYS_FIELD && !doc.contains_key(k))
                .cloned()
                .unwrap_or_default();
            return Err(JsonError::SchemaViolation(format!(
                "unknown field {unknown:?} in document"
            )));
        }
        Ok(doc)
    }

    pub fn to_json_string(&self) -> Result<String, JsonError> {
        Ok(self.to_json()?.to_string())
    }

    pub fn from_json_str(s: &str) -> Result<Document, JsonError> {
        let json: JsonValue =
            serde_json::from_str(s).map_err(|e| JsonError::Syntax(e.to_string()))?;
        Document::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use serde_json::json;

    #[test]
    fn document_projection_keeps_order() {
        let d = doc! { "b": 1i32, "a": "x", "n": 5i64 };
        let json = d.to_json().unwrap();
        assert_eq!(json["$k"], json!(["b", "a", "n"]));
        assert_eq!(json["n"], json!({ "$l": "5" }));
        assert_eq!(Document::from_json(&json).unwrap(), d);
    }

    #[test]
    fn document_rejects_unknown_field() {
        let err = Document::from_json(&json!({ "$k": ["a"], "a": 1, "b": 2 })).unwrap_err();
        assert!(matches!(err, JsonError::SchemaViolation(ref m) if m.contains("\"b\"")));
    }

    #[test]
    fn document_rejects_missing_field() {
        let err = Document::from_json(&json!({ "$k": ["a", "b"], "a": 1 })).unwrap_err();
        assert!(matches!(err, JsonError::SchemaViolation(_)));
    }

    #[test]
    fn document_rejects_duplicate_listed_key() {
        let err = Document::from_json(&json!({ "$k": ["a", "a"], "a": 1 })).unwrap_err();
        assert!(matches!(err, JsonError::SchemaViolation(_)));
    }

    #[test]
    fn reserved_key_cannot_be_projected() {
        let d = doc! { "$k": 1i32 };
        assert_eq!(
            d.to_json().unwrap_err(),
            JsonError::ReservedKey("$k".into())
        );
    }

    #[test]
    fn value_dispatch_on_wrapper_marker() {
        let v = Value::from_json_str(r#"{"$l": "12", "extra": 1}"#).unwrap_err();
        assert!(matches!(v, JsonError::SchemaViolation(_)));
        let v = Value::from_json_str(r#"{"$l": 12}"#).unwrap_err();
        assert!(matches!(v, JsonError::TypeMismatch { .. }));
        let v = Value::from_json_str(r#"{"what": 1}"#).unwrap_err();
        assert!(matches!(v, JsonError::SchemaViolation(_)));
        assert_eq!(Value::from_json_str("null").unwrap(), Value::Null);
    }

    #[test]
    fn plain_numbers_are_int32() {
        assert_eq!(Value::from_json_str("7").unwrap(), Value::Int32(7));
        assert!(matches!(
            Value::from_json_str("7.5").unwrap_err(),
            JsonError::TypeMismatch { .. }
        ));
        assert!(matches!(
            Value::from_json_str("4294967296").unwrap_err(),
            JsonError::InvalidValue(_)
        ));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            Document::from_json_str("{").unwrap_err(),
            JsonError::Syntax(_)
        ));
    }
}
