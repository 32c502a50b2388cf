pub mod schema;
pub mod document;
pub mod query;
pub mod codec;
pub mod transaction;
pub mod index;
pub mod queue;
pub mod watcher;
pub mod sync;
pub mod store;
pub mod error;

pub use error::{FolioError, Result};
pub use schema::{SchemaDefinition, SchemaView};
pub use document::{Document, Value};
pub use index::UpdateOptions;
pub use query::{default_matcher, QueryMatcher};
pub use store::{Collection, DocumentStore, StoreOptions};
pub use sync::{SyncAction, SyncEvent};
