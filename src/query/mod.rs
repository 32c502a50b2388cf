use crate::document::{Document, Value};
use std::sync::Arc;

/// A query is a document-shaped object; its semantics belong to the injected
/// matcher.
pub type Query = Document;

/// Injected query-matcher capability: accepts a query object and a document
/// and decides whether the document matches.
pub type QueryMatcher = Arc<dyn Fn(&Query, &Document) -> bool + Send + Sync>;

/// Field-equality matcher with `$and` support. An empty query matches every
/// document. Embedders with a richer query engine inject their own matcher.
pub fn default_matcher() -> QueryMatcher {
    Arc::new(matches)
}

fn matches(query: &Query, doc: &Document) -> bool {
    query.iter().all(|(field, expected)| {
        if field == "$and" {
            return match expected {
                Value::Array(clauses) => clauses.iter().all(|clause| match clause {
                    Value::Object(q) => matches(q, doc),
                    _ => false,
                }),
                _ => false,
            };
        }
        doc.get(field) == Some(expected)
    })
}
