use crate::error::{FolioError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Field name carrying the owning entity set on the wire and in `config.json`.
/// Never present in documents returned through the API.
pub const ENTITY_SET_FIELD: &str = "$entitySet";

/// A dynamic field value. `Timestamp` round-trips through RFC 3339 strings in
/// JSON; `Bytes` through base64 in `config.json` and raw bytes in split
/// document-property files.
///
/// `Clone` is the deep-clone routine the store applies at every boundary:
/// documents handed out by `find` and documents taken in by `insert`/`update`
/// are always clones of the indexed state.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// A document is a mapping from field name to value.
pub type Document = BTreeMap<String, Value>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Convert a value to its wire (JSON) representation.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
        Value::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Object(fields) => serde_json::Value::Object(
            fields.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
        ),
    }
}

/// Convert a JSON value back without schema knowledge. Strings stay strings;
/// schema-aware coercion (timestamps, binary, complex types) happens in the
/// codec where the field types are known.
pub fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(fields) => Value::Object(
            fields.into_iter().map(|(k, v)| (k, from_json(v))).collect(),
        ),
    }
}

/// Serialize a whole document to a JSON object.
pub fn doc_to_json(doc: &Document) -> serde_json::Map<String, serde_json::Value> {
    doc.iter().map(|(k, v)| (k.clone(), to_json(v))).collect()
}

/// Deserialize a JSON object into a document without schema coercion.
pub fn doc_from_json(obj: serde_json::Map<String, serde_json::Value>) -> Document {
    obj.into_iter().map(|(k, v)| (k, from_json(v))).collect()
}

/// Check that a publicKey value is safe to use as a filesystem name:
/// non-empty, no path separators, and no leading `~` (the staging prefix).
pub fn validate_public_key(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('~')
    {
        return Err(FolioError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Extract the publicKey string of a document, validating it.
pub fn public_key_of(doc: &Document, public_key_field: &str) -> Result<String> {
    let key = doc
        .get(public_key_field)
        .and_then(Value::as_str)
        .unwrap_or("");
    validate_public_key(key)?;
    Ok(key.to_string())
}
