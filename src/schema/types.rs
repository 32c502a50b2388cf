use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level schema descriptor. Can be built programmatically or parsed from
/// a human-edited `schema.yaml` in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaDefinition {
    /// Entity types, bound to sets via `entity_sets`.
    #[serde(default)]
    pub types: BTreeMap<String, EntityTypeDefinition>,
    /// Complex types referenced by fields; never bound to a set directly.
    #[serde(default)]
    pub complex_types: BTreeMap<String, EntityTypeDefinition>,
    #[serde(default)]
    pub entity_sets: BTreeMap<String, EntitySetDefinition>,
}

/// An ordered set of named fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntityTypeDefinition {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
}

/// A named collection bound to an entity type and a storage mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySetDefinition {
    pub entity_type: String,
    #[serde(default)]
    pub mode: StorageMode,
}

/// How a set is persisted: one directory per document, or one append-only
/// newline-delimited file for the whole set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Directory,
    Flat,
}

/// Definition of a single field in an entity or complex type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// The primary key field; unique, exactly one per type. Assigned on
    /// insert when missing.
    #[serde(default)]
    pub key: bool,
    /// The human-readable name used in filesystem paths. When no field
    /// carries this flag the key field is used.
    #[serde(default)]
    pub public_key: bool,
    /// When set, this field is persisted as its own file instead of living
    /// inside `config.json`.
    #[serde(default)]
    pub document: Option<DocumentHint>,
}

/// Field type enumeration. Anything that is not a built-in semantic type is
/// a reference to a complex type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Binary,
    DateTimeOffset,
    #[serde(untagged)]
    Complex(std::string::String),
}

/// Storage hint for a document-property field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentHint {
    pub extension: String,
    #[serde(default)]
    pub engine_hint: Option<String>,
}
