use crate::document::{self, Document, Value};
use crate::error::{FolioError, Result};
use crate::query::Query;
use crate::schema::SchemaView;
use std::collections::HashSet;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
}

/// What an update did: the `(before, after)` pairs of every patched
/// document, or the single document created by an upsert.
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(Vec<(Document, Document)>),
    Upserted(Document),
}

/// Per-entity-set in-memory sequence of documents. The index owns the
/// canonical document objects; every document crossing its boundary is a
/// deep clone, so callers can never mutate indexed state in place.
pub struct MemoryIndex {
    schema: Arc<SchemaView>,
    sets: BTreeMap<String, Vec<Document>>,
}

impl MemoryIndex {
    pub fn new(schema: Arc<SchemaView>) -> Self {
        let sets = schema
            .set_names()
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();
        MemoryIndex { schema, sets }
    }

    /// Replace the contents of a set with decoded documents, asserting
    /// publicKey uniqueness.
    pub fn load(&mut self, set: &str, docs: Vec<Document>) -> Result<()> {
        let pk_field = self.schema.public_key_field(set)?.to_string();
        let mut seen = HashSet::new();
        for doc in &docs {
            let pk = document::public_key_of(doc, &pk_field)?;
            if !seen.insert(pk.clone()) {
                return Err(FolioError::DuplicateKey {
                    set: set.to_string(),
                    key: pk,
                });
            }
        }
        self.sets.insert(set.to_string(), docs);
        Ok(())
    }

    /// Snapshot a set for rollback.
    pub fn snapshot(&self, set: &str) -> Vec<Document> {
        self.sets.get(set).cloned().unwrap_or_default()
    }

    pub fn restore(&mut self, set: &str, docs: Vec<Document>) {
        self.sets.insert(set.to_string(), docs);
    }

    /// Matching documents, as deep clones.
    pub fn find(&self, set: &str, query: &Query, matcher: &dyn Fn(&Query, &Document) -> bool) -> Result<Vec<Document>> {
        self.schema.set(set)?;
        Ok(self
            .sets
            .get(set)
            .map(|docs| docs.iter().filter(|d| matcher(query, d)).cloned().collect())
            .unwrap_or_default())
    }

    /// Insert a document: assigns the key field when missing, validates the
    /// publicKey and its uniqueness, stores a clone. Returns the stored form.
    pub fn insert(&mut self, set: &str, mut doc: Document) -> Result<Document> {
        let key_field = self.schema.key_field(set)?.to_string();
        let pk_field = self.schema.public_key_field(set)?.to_string();
        let pk = document::public_key_of(&doc, &pk_field)?;

        let missing_key = doc
            .get(&key_field)
            .map(Value::is_null)
            .unwrap_or(true);
        if missing_key {
            doc.insert(
                key_field,
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }

        let docs = self.sets.entry(set.to_string()).or_default();
        if docs
            .iter()
            .any(|d| d.get(&pk_field).and_then(Value::as_str) == Some(pk.as_str()))
        {
            return Err(FolioError::DuplicateKey {
                set: set.to_string(),
                key: pk,
            });
        }
        docs.push(doc.clone());
        Ok(doc)
    }

    /// Apply a patch to every match. Renames are validated for publicKey
    /// shape and uniqueness across all targets before any document is
    /// mutated, so a conflicting multi-match update changes nothing.
    pub fn update(
        &mut self,
        set: &str,
        query: &Query,
        patch: &Document,
        options: UpdateOptions,
        matcher: &dyn Fn(&Query, &Document) -> bool,
    ) -> Result<UpdateOutcome> {
        let pk_field = self.schema.public_key_field(set)?.to_string();

        let matched: Vec<usize> = self
            .sets
            .get(set)
            .map(|docs| {
                docs.iter()
                    .enumerate()
                    .filter(|(_, d)| matcher(query, d))
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();

        if matched.is_empty() {
            if options.upsert {
                let stored = self.insert(set, upsert_document(query, patch))?;
                return Ok(UpdateOutcome::Upserted(stored));
            }
            return Ok(UpdateOutcome::Updated(Vec::new()));
        }

        let docs = self
            .sets
            .get_mut(set)
            .ok_or_else(|| FolioError::SchemaUnknown(set.to_string()))?;

        let mut staged: Vec<(usize, Document)> = Vec::new();
        let mut new_keys = HashSet::new();
        for &i in &matched {
            let after = apply_patch(&docs[i], patch);
            let pk = document::public_key_of(&after, &pk_field)?;
            if !new_keys.insert(pk.clone()) {
                return Err(FolioError::DuplicateKey {
                    set: set.to_string(),
                    key: pk,
                });
            }
            staged.push((i, after));
        }
        let matched_set: HashSet<usize> = matched.iter().copied().collect();
        for (j, doc) in docs.iter().enumerate() {
            if matched_set.contains(&j) {
                continue;
            }
            if let Some(pk) = doc.get(&pk_field).and_then(Value::as_str) {
                if new_keys.contains(pk) {
                    return Err(FolioError::DuplicateKey {
                        set: set.to_string(),
                        key: pk.to_string(),
                    });
                }
            }
        }

        let mut pairs = Vec::with_capacity(staged.len());
        for (i, after) in staged {
            let before = std::mem::replace(&mut docs[i], after.clone());
            pairs.push((before, after));
        }
        Ok(UpdateOutcome::Updated(pairs))
    }

    /// Remove every match; returns the removed documents.
    pub fn remove(
        &mut self,
        set: &str,
        query: &Query,
        matcher: &dyn Fn(&Query, &Document) -> bool,
    ) -> Result<Vec<Document>> {
        self.schema.set(set)?;
        let mut removed = Vec::new();
        if let Some(docs) = self.sets.get_mut(set) {
            docs.retain(|d| {
                if matcher(query, d) {
                    removed.push(d.clone());
                    false
                } else {
                    true
                }
            });
        }
        Ok(removed)
    }

    // ── Replica application (sync subscriptions, watcher reloads) ──────

    /// Insert-or-replace keyed by the key field. Used when applying
    /// subscribed events, where the publisher already persisted.
    pub fn apply_insert(&mut self, set: &str, doc: Document) -> Result<Document> {
        let key_field = self.schema.key_field(set)?.to_string();
        let pk_field = self.schema.public_key_field(set)?.to_string();
        let pk = document::public_key_of(&doc, &pk_field)?;

        let docs = self.sets.entry(set.to_string()).or_default();
        let key = doc.get(&key_field).cloned();
        if let Some(pos) = docs
            .iter()
            .position(|d| key.is_some() && d.get(&key_field) == key.as_ref())
        {
            docs[pos] = doc.clone();
            return Ok(doc);
        }
        if docs
            .iter()
            .any(|d| d.get(&pk_field).and_then(Value::as_str) == Some(pk.as_str()))
        {
            return Err(FolioError::DuplicateKey {
                set: set.to_string(),
                key: pk,
            });
        }
        docs.push(doc.clone());
        Ok(doc)
    }

    /// Replace a document keyed by the key field; `false` when absent.
    pub fn update_by_key(&mut self, set: &str, doc: Document) -> Result<bool> {
        let key_field = self.schema.key_field(set)?.to_string();
        let key = doc.get(&key_field).cloned();
        if let Some(docs) = self.sets.get_mut(set) {
            if let Some(pos) = docs
                .iter()
                .position(|d| key.is_some() && d.get(&key_field) == key.as_ref())
            {
                docs[pos] = doc;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn remove_by_key(&mut self, set: &str, key: &Value) -> Result<Option<Document>> {
        let key_field = self.schema.key_field(set)?.to_string();
        if let Some(docs) = self.sets.get_mut(set) {
            if let Some(pos) = docs.iter().position(|d| d.get(&key_field) == Some(key)) {
                return Ok(Some(docs.remove(pos)));
            }
        }
        Ok(None)
    }

    pub fn remove_by_public_key(&mut self, set: &str, public_key: &str) -> Result<Option<Document>> {
        let pk_field = self.schema.public_key_field(set)?.to_string();
        if let Some(docs) = self.sets.get_mut(set) {
            if let Some(pos) = docs
                .iter()
                .position(|d| d.get(&pk_field).and_then(Value::as_str) == Some(public_key))
            {
                return Ok(Some(docs.remove(pos)));
            }
        }
        Ok(None)
    }

    /// Replace whatever lives under this publicKey with a freshly decoded
    /// document (external edits may have changed even the key field).
    pub fn upsert_by_public_key(
        &mut self,
        set: &str,
        public_key: &str,
        doc: Document,
    ) -> Result<Document> {
        self.remove_by_public_key(set, public_key)?;
        self.apply_insert(set, doc)
    }
}

/// Apply a patch document: the fields under `$set` (and any plain top-level
/// fields) overwrite the originals. Unknown `$`-operators are ignored; their
/// semantics belong to the query-engine collaborator.
pub fn apply_patch(doc: &Document, patch: &Document) -> Document {
    let mut next = doc.clone();
    if let Some(Value::Object(set_fields)) = patch.get("$set") {
        for (k, v) in set_fields {
            next.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in patch {
        if k.starts_with('$') {
            continue;
        }
        next.insert(k.clone(), v.clone());
    }
    next
}

/// Derive the document an upsert inserts: the query's plain fields with the
/// patch applied on top.
pub fn upsert_document(query: &Query, patch: &Document) -> Document {
    let base: Document = query
        .iter()
        .filter(|(k, _)| !k.starts_with('$'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    apply_patch(&base, patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::default_matcher;
    use crate::schema::{parse_schema_str, SchemaView};

    fn index() -> MemoryIndex {
        let yaml = r#"
types:
  Template:
    fields:
      _id: { type: string, key: true }
      name: { type: string, public_key: true }
      content: { type: string }
entity_sets:
  templates: { entity_type: Template }
"#;
        MemoryIndex::new(Arc::new(
            SchemaView::new(parse_schema_str(yaml).unwrap()).unwrap(),
        ))
    }

    fn doc(pairs: &[(&str, &str)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_insert_assigns_key() {
        let mut index = index();
        let stored = index.insert("templates", doc(&[("name", "a")])).unwrap();
        assert!(matches!(stored.get("_id"), Some(Value::String(id)) if !id.is_empty()));
    }

    #[test]
    fn test_insert_duplicate_public_key_rejected() {
        let mut index = index();
        index.insert("templates", doc(&[("name", "a")])).unwrap();
        let err = index.insert("templates", doc(&[("name", "a")])).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_insert_invalid_name_rejected() {
        let mut index = index();
        assert!(matches!(
            index.insert("templates", doc(&[("name", "a/b")])),
            Err(FolioError::InvalidName(_))
        ));
        assert!(matches!(
            index.insert("templates", doc(&[("content", "x")])),
            Err(FolioError::InvalidName(_))
        ));
    }

    #[test]
    fn test_find_returns_clones() {
        let mut index = index();
        index
            .insert("templates", doc(&[("name", "a"), ("content", "x")]))
            .unwrap();
        let matcher = default_matcher();

        let mut found = index
            .find("templates", &Document::new(), matcher.as_ref())
            .unwrap();
        found[0].insert("content".to_string(), Value::from("mutated"));

        let again = index.find("templates", &Document::new(), matcher.as_ref()).unwrap();
        assert_eq!(again[0].get("content"), Some(&Value::from("x")));
    }

    #[test]
    fn test_update_with_set_patch() {
        let mut index = index();
        index
            .insert("templates", doc(&[("name", "a"), ("content", "x")]))
            .unwrap();
        let matcher = default_matcher();

        let patch = Document::from([(
            "$set".to_string(),
            Value::Object(doc(&[("content", "y")])),
        )]);
        let outcome = index
            .update(
                "templates",
                &doc(&[("name", "a")]),
                &patch,
                UpdateOptions::default(),
                matcher.as_ref(),
            )
            .unwrap();

        match outcome {
            UpdateOutcome::Updated(pairs) => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].1.get("content"), Some(&Value::from("y")));
            }
            _ => panic!("expected an update"),
        }
    }

    #[test]
    fn test_update_upsert_inserts_when_no_match() {
        let mut index = index();
        let matcher = default_matcher();
        let patch = Document::from([(
            "$set".to_string(),
            Value::Object(doc(&[("content", "x")])),
        )]);

        let outcome = index
            .update(
                "templates",
                &doc(&[("name", "a")]),
                &patch,
                UpdateOptions { upsert: true },
                matcher.as_ref(),
            )
            .unwrap();

        match outcome {
            UpdateOutcome::Upserted(stored) => {
                assert_eq!(stored.get("name"), Some(&Value::from("a")));
                assert_eq!(stored.get("content"), Some(&Value::from("x")));
                assert!(stored.contains_key("_id"));
            }
            _ => panic!("expected an upsert"),
        }
    }

    #[test]
    fn test_rename_to_duplicate_is_validated_before_mutation() {
        let mut index = index();
        index.insert("templates", doc(&[("name", "a")])).unwrap();
        index.insert("templates", doc(&[("name", "b")])).unwrap();
        let matcher = default_matcher();

        // rename both matches to the same name: nothing may change
        let patch = Document::from([(
            "$set".to_string(),
            Value::Object(doc(&[("name", "c")])),
        )]);
        let err = index
            .update(
                "templates",
                &Document::new(),
                &patch,
                UpdateOptions::default(),
                matcher.as_ref(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));

        let names: Vec<_> = index
            .find("templates", &Document::new(), matcher.as_ref())
            .unwrap()
            .into_iter()
            .map(|d| d.get("name").cloned())
            .collect();
        assert_eq!(names, vec![Some(Value::from("a")), Some(Value::from("b"))]);
    }

    #[test]
    fn test_rename_onto_existing_document_rejected() {
        let mut index = index();
        index.insert("templates", doc(&[("name", "a")])).unwrap();
        index.insert("templates", doc(&[("name", "b")])).unwrap();
        let matcher = default_matcher();

        let patch = Document::from([(
            "$set".to_string(),
            Value::Object(doc(&[("name", "b")])),
        )]);
        let err = index
            .update(
                "templates",
                &doc(&[("name", "a")]),
                &patch,
                UpdateOptions::default(),
                matcher.as_ref(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_remove_returns_removed() {
        let mut index = index();
        index.insert("templates", doc(&[("name", "a")])).unwrap();
        index.insert("templates", doc(&[("name", "b")])).unwrap();
        let matcher = default_matcher();

        let removed = index
            .remove("templates", &doc(&[("name", "a")]), matcher.as_ref())
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(
            index
                .find("templates", &Document::new(), matcher.as_ref())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_load_asserts_uniqueness() {
        let mut index = index();
        let err = index
            .load(
                "templates",
                vec![doc(&[("name", "a")]), doc(&[("name", "a")])],
            )
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }
}
