use crate::error::Result;
use crate::schema::SchemaDefinition;
use std::path::Path;

/// Parse a schema descriptor from a YAML file.
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let raw = std::fs::read_to_string(path)?;
    parse_schema_str(&raw)
}

/// Parse a schema descriptor from a YAML string.
pub fn parse_schema_str(raw: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(raw)?;
    Ok(schema)
}
