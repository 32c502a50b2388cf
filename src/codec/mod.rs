use crate::document::{self, Document, Value, ENTITY_SET_FIELD};
use crate::error::{FolioError, Result};
use crate::schema::{FieldDefinition, FieldType, SchemaView};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File holding every field of a document except its document properties.
pub const CONFIG_FILE: &str = "config.json";

/// Marker field of a flat-codec tombstone record.
pub const TOMBSTONE_FIELD: &str = "$$deleted";

/// One file of an encoded directory-mode document.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Encode a document for directory-mode storage: a `config.json` with every
/// non-document field plus `$entitySet`, and one file per document property
/// that is present. Absent properties produce no file.
pub fn encode_directory(
    schema: &SchemaView,
    set: &str,
    doc: &Document,
) -> Result<Vec<EncodedFile>> {
    let mut config = document::doc_to_json(doc);
    let mut files = Vec::new();

    for property in schema.document_properties(set)? {
        config.remove(&property.field);
        let value = match doc.get(&property.field) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };
        let extension = schema.resolve_extension(doc, &property);
        let contents = match value {
            Value::String(s) => s.clone().into_bytes(),
            Value::Bytes(b) => b.clone(),
            other => serde_json::to_vec(&document::to_json(other))?,
        };
        files.push(EncodedFile {
            name: format!("{}.{}", property.field, extension),
            contents,
        });
    }

    config.insert(
        ENTITY_SET_FIELD.to_string(),
        serde_json::Value::String(set.to_string()),
    );
    let mut contents = serde_json::to_vec_pretty(&serde_json::Value::Object(config))?;
    contents.push(b'\n');
    files.insert(
        0,
        EncodedFile {
            name: CONFIG_FILE.to_string(),
            contents,
        },
    );

    Ok(files)
}

/// Decode a directory-mode document: parse `config.json`, coerce fields to
/// their schema types, then read each document-property file found next to
/// it. Missing property files decode to missing fields. The extension may
/// differ from the schema default (a resolver chose it), so properties are
/// located by file stem.
pub fn decode_directory(schema: &SchemaView, set: &str, dir: &Path) -> Result<Document> {
    let config_path = dir.join(CONFIG_FILE);
    let raw = std::fs::read(&config_path)
        .map_err(|e| decode_error(&config_path, e.to_string()))?;
    let json: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| decode_error(&config_path, e.to_string()))?;
    let obj = json
        .as_object()
        .ok_or_else(|| decode_error(&config_path, "expected a JSON object"))?
        .clone();

    let fields = &schema.entity_type(set)?.fields;
    let mut doc = coerce_object(schema, fields, obj)
        .map_err(|e| relocate_decode_error(e, &config_path))?;
    doc.remove(ENTITY_SET_FIELD);

    let properties = schema.document_properties(set)?;
    if !properties.is_empty() {
        let mut by_stem: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == CONFIG_FILE || name.starts_with('.') || !entry.path().is_file() {
                continue;
            }
            if let Some(stem) = Path::new(&name).file_stem().and_then(|s| s.to_str()) {
                by_stem.insert(stem.to_string(), entry.path());
            }
        }

        for property in &properties {
            let path = match by_stem.get(&property.field) {
                Some(p) => p,
                None => {
                    doc.remove(&property.field);
                    continue;
                }
            };
            let bytes = std::fs::read(path)?;
            let value = match fields.get(&property.field).map(|f| &f.field_type) {
                Some(FieldType::Binary) => Value::Bytes(bytes),
                _ => Value::String(
                    String::from_utf8(bytes)
                        .map_err(|e| decode_error(path, e.to_string()))?,
                ),
            };
            doc.insert(property.field.clone(), value);
        }
    }

    Ok(doc)
}

/// Encode a full document as one flat-codec line.
pub fn encode_flat_record(doc: &Document) -> Result<Vec<u8>> {
    let obj = document::doc_to_json(doc);
    let mut line = serde_json::to_vec(&serde_json::Value::Object(obj))?;
    line.push(b'\n');
    Ok(line)
}

/// Encode a flat-codec tombstone: `{<key-field>: key, "$$deleted": true}`.
pub fn encode_flat_tombstone(key_field: &str, key: &Value) -> Result<Vec<u8>> {
    let mut obj = serde_json::Map::new();
    obj.insert(key_field.to_string(), document::to_json(key));
    obj.insert(TOMBSTONE_FIELD.to_string(), serde_json::Value::Bool(true));
    let mut line = serde_json::to_vec(&serde_json::Value::Object(obj))?;
    line.push(b'\n');
    Ok(line)
}

/// Replay a flat-codec file: records apply in order as insert/overwrite keyed
/// by the key field, tombstones remove. Malformed lines are logged and
/// skipped.
pub fn decode_flat(schema: &SchemaView, set: &str, path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path)?;
    let key_field = schema.key_field(set)?;
    let fields = &schema.entity_type(set)?.fields;

    let mut docs: Vec<Document> = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let obj = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(obj)) => obj,
            Ok(_) => {
                log::warn!(
                    "Skipping non-object record at {}:{}",
                    path.display(),
                    line_no + 1
                );
                continue;
            }
            Err(e) => {
                log::warn!(
                    "Skipping malformed record at {}:{}: {e}",
                    path.display(),
                    line_no + 1
                );
                continue;
            }
        };

        let deleted = obj
            .get(TOMBSTONE_FIELD)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let key = obj.get(key_field).cloned().map(document::from_json);

        if deleted {
            if let Some(key) = key {
                docs.retain(|d| d.get(key_field) != Some(&key));
            }
            continue;
        }

        let mut doc = match coerce_object(schema, fields, obj) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!(
                    "Skipping record at {}:{}: {e}",
                    path.display(),
                    line_no + 1
                );
                continue;
            }
        };
        doc.remove(ENTITY_SET_FIELD);
        doc.remove(TOMBSTONE_FIELD);

        match docs.iter().position(|d| {
            key.is_some() && d.get(key_field) == key.as_ref()
        }) {
            Some(pos) => docs[pos] = doc,
            None => docs.push(doc),
        }
    }

    Ok(docs)
}

/// Coerce a JSON object to a document using the field definitions of its
/// type: `DateTimeOffset` fields parse from RFC 3339 strings, `Binary` from
/// base64, complex-type fields recurse. Undeclared fields convert generically.
pub fn coerce_object(
    schema: &SchemaView,
    fields: &BTreeMap<String, FieldDefinition>,
    obj: serde_json::Map<String, serde_json::Value>,
) -> Result<Document> {
    let mut doc = Document::new();
    for (name, value) in obj {
        let coerced = match fields.get(&name) {
            Some(field) => coerce_value(schema, &field.field_type, value)?,
            None => document::from_json(value),
        };
        doc.insert(name, coerced);
    }
    Ok(doc)
}

fn coerce_value(
    schema: &SchemaView,
    field_type: &FieldType,
    value: serde_json::Value,
) -> Result<Value> {
    match (field_type, value) {
        (_, serde_json::Value::Null) => Ok(Value::Null),
        (FieldType::DateTimeOffset, serde_json::Value::String(s)) => {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| FolioError::Decode {
                    path: String::new(),
                    message: format!("invalid timestamp '{s}': {e}"),
                })
        }
        (FieldType::Binary, serde_json::Value::String(s)) => BASE64
            .decode(s.as_bytes())
            .map(Value::Bytes)
            .map_err(|e| FolioError::Decode {
                path: String::new(),
                message: format!("invalid base64: {e}"),
            }),
        (FieldType::Complex(name), serde_json::Value::Object(obj)) => {
            match schema.complex_type(name) {
                Some(complex) => Ok(Value::Object(coerce_object(schema, &complex.fields, obj)?)),
                None => Ok(document::from_json(serde_json::Value::Object(obj))),
            }
        }
        (FieldType::Complex(_), serde_json::Value::Array(items)) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| coerce_value(schema, field_type, item))
                .collect::<Result<Vec<_>>>()?,
        )),
        (_, other) => Ok(document::from_json(other)),
    }
}

fn decode_error(path: &Path, message: impl Into<String>) -> FolioError {
    FolioError::Decode {
        path: path.display().to_string(),
        message: message.into(),
    }
}

fn relocate_decode_error(err: FolioError, path: &Path) -> FolioError {
    match err {
        FolioError::Decode { message, .. } => decode_error(path, message),
        other => other,
    }
}
