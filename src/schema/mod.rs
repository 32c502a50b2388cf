pub mod parser;
pub mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use types::{
    DocumentHint, EntitySetDefinition, EntityTypeDefinition, FieldDefinition, FieldType,
    SchemaDefinition, StorageMode,
};

use crate::document::Document;
use crate::error::{FolioError, Result};

/// A document-property descriptor projected out of the schema: the field
/// name, its default file extension and an optional rendering-engine hint.
#[derive(Debug, Clone)]
pub struct DocumentProperty {
    pub field: String,
    pub extension: String,
    pub engine_hint: Option<String>,
}

/// An externally supplied extension override. Resolvers are consulted in
/// registration order; the first `Some` wins, otherwise the schema default
/// extension applies.
pub type ExtensionResolver =
    Box<dyn Fn(&Document, &DocumentProperty) -> Option<String> + Send + Sync>;

/// Read-only projection of the registered entity sets: storage mode, key and
/// publicKey fields, and document-property descriptors per set.
pub struct SchemaView {
    definition: SchemaDefinition,
    resolvers: Vec<ExtensionResolver>,
}

impl SchemaView {
    /// Wrap a schema descriptor, validating it first.
    pub fn new(definition: SchemaDefinition) -> Result<Self> {
        validate_definition(&definition)?;
        Ok(SchemaView {
            definition,
            resolvers: Vec::new(),
        })
    }

    /// Append an extension resolver to the chain.
    pub fn register_extension_resolver(&mut self, resolver: ExtensionResolver) {
        self.resolvers.push(resolver);
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn set_names(&self) -> Vec<String> {
        self.definition.entity_sets.keys().cloned().collect()
    }

    pub fn set(&self, name: &str) -> Result<&EntitySetDefinition> {
        self.definition
            .entity_sets
            .get(name)
            .ok_or_else(|| FolioError::SchemaUnknown(name.to_string()))
    }

    pub fn mode(&self, set: &str) -> Result<StorageMode> {
        Ok(self.set(set)?.mode)
    }

    pub fn entity_type(&self, set: &str) -> Result<&EntityTypeDefinition> {
        let type_name = &self.set(set)?.entity_type;
        self.definition
            .types
            .get(type_name)
            .ok_or_else(|| FolioError::Schema(format!("Entity type '{type_name}' not registered")))
    }

    pub fn complex_type(&self, name: &str) -> Option<&EntityTypeDefinition> {
        self.definition.complex_types.get(name)
    }

    /// The primary key field of a set's entity type.
    pub fn key_field(&self, set: &str) -> Result<&str> {
        let entity_type = self.entity_type(set)?;
        entity_type
            .fields
            .iter()
            .find(|(_, f)| f.key)
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| FolioError::Schema(format!("Entity set '{set}' has no key field")))
    }

    /// The field used for filesystem names; falls back to the key field.
    pub fn public_key_field(&self, set: &str) -> Result<&str> {
        let entity_type = self.entity_type(set)?;
        if let Some((name, _)) = entity_type.fields.iter().find(|(_, f)| f.public_key) {
            return Ok(name.as_str());
        }
        self.key_field(set)
    }

    /// All document-property descriptors of a set's entity type.
    pub fn document_properties(&self, set: &str) -> Result<Vec<DocumentProperty>> {
        let entity_type = self.entity_type(set)?;
        Ok(entity_type
            .fields
            .iter()
            .filter_map(|(name, field)| {
                field.document.as_ref().map(|hint| DocumentProperty {
                    field: name.clone(),
                    extension: hint.extension.clone(),
                    engine_hint: hint.engine_hint.clone(),
                })
            })
            .collect())
    }

    /// Resolve the file extension for a document property, consulting the
    /// resolver chain before the schema default.
    pub fn resolve_extension(&self, doc: &Document, property: &DocumentProperty) -> String {
        for resolver in &self.resolvers {
            if let Some(extension) = resolver(doc, property) {
                return extension;
            }
        }
        property.extension.clone()
    }
}

fn validate_definition(definition: &SchemaDefinition) -> Result<()> {
    for (set_name, set) in &definition.entity_sets {
        if !definition.types.contains_key(&set.entity_type) {
            return Err(FolioError::Schema(format!(
                "Entity set '{set_name}' references unknown entity type '{}'",
                set.entity_type
            )));
        }
    }

    for (type_name, entity_type) in definition
        .types
        .iter()
        .chain(definition.complex_types.iter())
    {
        let keys = entity_type.fields.values().filter(|f| f.key).count();
        let is_entity = definition.types.contains_key(type_name);
        if is_entity && keys != 1 {
            return Err(FolioError::Schema(format!(
                "Entity type '{type_name}' must declare exactly one key field, found {keys}"
            )));
        }

        let public_keys = entity_type.fields.values().filter(|f| f.public_key).count();
        if public_keys > 1 {
            return Err(FolioError::Schema(format!(
                "Type '{type_name}' declares {public_keys} publicKey fields"
            )));
        }

        for (field_name, field) in &entity_type.fields {
            if field.document.is_some()
                && !matches!(field.field_type, FieldType::String | FieldType::Binary)
            {
                return Err(FolioError::Schema(format!(
                    "Document property '{type_name}.{field_name}' must be string or binary"
                )));
            }
            if let FieldType::Complex(ref target) = field.field_type {
                if !definition.complex_types.contains_key(target)
                    && !definition.types.contains_key(target)
                {
                    return Err(FolioError::Schema(format!(
                        "Field '{type_name}.{field_name}' references unknown type '{target}'"
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;

    fn sample_yaml() -> &'static str {
        r#"
types:
  Template:
    fields:
      _id: { type: string, key: true }
      name: { type: string, public_key: true }
      content: { type: string, document: { extension: html, engine_hint: handlebars } }
      modified: { type: date_time_offset }
  Setting:
    fields:
      _id: { type: string, key: true }
      key: { type: string, public_key: true }
      value: { type: string }
entity_sets:
  templates: { entity_type: Template }
  settings: { entity_type: Setting, mode: flat }
"#
    }

    #[test]
    fn test_parse_and_project() {
        let view = SchemaView::new(parse_schema_str(sample_yaml()).unwrap()).unwrap();

        assert_eq!(view.mode("templates").unwrap(), StorageMode::Directory);
        assert_eq!(view.mode("settings").unwrap(), StorageMode::Flat);
        assert_eq!(view.key_field("templates").unwrap(), "_id");
        assert_eq!(view.public_key_field("templates").unwrap(), "name");

        let props = view.document_properties("templates").unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].field, "content");
        assert_eq!(props[0].extension, "html");
        assert_eq!(props[0].engine_hint.as_deref(), Some("handlebars"));
    }

    #[test]
    fn test_public_key_falls_back_to_key() {
        let yaml = r#"
types:
  Counter:
    fields:
      _id: { type: string, key: true }
entity_sets:
  counters: { entity_type: Counter }
"#;
        let view = SchemaView::new(parse_schema_str(yaml).unwrap()).unwrap();
        assert_eq!(view.public_key_field("counters").unwrap(), "_id");
    }

    #[test]
    fn test_unknown_set_errors() {
        let view = SchemaView::new(parse_schema_str(sample_yaml()).unwrap()).unwrap();
        assert!(matches!(
            view.set("nope"),
            Err(FolioError::SchemaUnknown(_))
        ));
    }

    #[test]
    fn test_missing_key_field_rejected() {
        let yaml = r#"
types:
  Bad:
    fields:
      name: { type: string }
entity_sets:
  bads: { entity_type: Bad }
"#;
        let result = SchemaView::new(parse_schema_str(yaml).unwrap());
        assert!(matches!(result, Err(FolioError::Schema(_))));
    }

    #[test]
    fn test_unknown_entity_type_rejected() {
        let yaml = r#"
entity_sets:
  ghosts: { entity_type: Ghost }
"#;
        let result = SchemaView::new(parse_schema_str(yaml).unwrap());
        assert!(matches!(result, Err(FolioError::Schema(_))));
    }

    #[test]
    fn test_resolver_chain_first_some_wins() {
        let mut view = SchemaView::new(parse_schema_str(sample_yaml()).unwrap()).unwrap();
        view.register_extension_resolver(Box::new(|_, _| None));
        view.register_extension_resolver(Box::new(|_, prop| {
            (prop.field == "content").then(|| "txt".to_string())
        }));
        view.register_extension_resolver(Box::new(|_, _| Some("never".to_string())));

        let doc = Document::from([("name".to_string(), Value::from("t"))]);
        let props = view.document_properties("templates").unwrap();
        assert_eq!(view.resolve_extension(&doc, &props[0]), "txt");
    }

    #[test]
    fn test_resolver_default_applies() {
        let view = SchemaView::new(parse_schema_str(sample_yaml()).unwrap()).unwrap();
        let doc = Document::new();
        let props = view.document_properties("templates").unwrap();
        assert_eq!(view.resolve_extension(&doc, &props[0]), "html");
    }
}
