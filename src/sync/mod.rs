use crate::document::{self, Document, ENTITY_SET_FIELD};
use crate::error::{FolioError, Result};
use crate::queue::{self, Op};
use crate::schema::SchemaView;
use crate::watcher::FileWatcher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};

/// What a sync envelope announces. `Refresh` carries only a locator and
/// instructs subscribers to re-read from disk; `Reload` marks changes the
/// watcher observed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Insert,
    Update,
    Remove,
    Refresh,
    Reload,
}

/// The wire envelope: `{action, doc}` where `doc` always carries
/// `$entitySet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub action: SyncAction,
    pub doc: serde_json::Value,
}

impl SyncEvent {
    /// Build an envelope for a document, injecting `$entitySet`.
    pub fn new(action: SyncAction, set: &str, doc: &Document) -> Self {
        let mut obj = document::doc_to_json(doc);
        obj.insert(
            ENTITY_SET_FIELD.to_string(),
            serde_json::Value::String(set.to_string()),
        );
        SyncEvent {
            action,
            doc: serde_json::Value::Object(obj),
        }
    }

    pub fn entity_set(&self) -> Option<&str> {
        self.doc.get(ENTITY_SET_FIELD)?.as_str()
    }
}

/// Unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SyncCallback = Box<dyn Fn(&SyncEvent) + Send>;

/// Publishes post-commit events to subscribers and applies inbound events
/// from other provider instances through the write queue. Oversized
/// envelopes fall back to `refresh` locators.
pub struct SyncChannel {
    schema: Arc<SchemaView>,
    message_size_limit: usize,
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, SyncCallback>>,
    queue_tx: Sender<Op>,
    watcher: Mutex<Option<FileWatcher>>,
}

impl SyncChannel {
    pub(crate) fn new(
        schema: Arc<SchemaView>,
        message_size_limit: usize,
        queue_tx: Sender<Op>,
    ) -> Self {
        SyncChannel {
            schema,
            message_size_limit,
            next_id: AtomicU64::new(1),
            subs: Mutex::new(HashMap::new()),
            queue_tx,
            watcher: Mutex::new(None),
        }
    }

    /// Subscribe to published events. Callbacks run on the write-queue
    /// worker thread and must not call back into the store synchronously.
    pub fn subscribe(&self, callback: Box<dyn Fn(&SyncEvent) + Send>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().insert(id, callback);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subs.lock().unwrap().remove(&id.0);
    }

    /// Publish an envelope to every subscriber, downgrading to a `refresh`
    /// locator when it exceeds the message size limit.
    pub fn publish(&self, event: SyncEvent) {
        let event = self.apply_size_limit(event);
        let subs = self.subs.lock().unwrap();
        for callback in subs.values() {
            callback(&event);
        }
    }

    /// Apply an envelope received from another provider instance. The
    /// mutation flows through the write queue for mutual exclusion with
    /// local mutations and never re-publishes.
    pub fn subscription(&self, event: SyncEvent) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.queue_tx
            .send(Op::Apply { event, reply })
            .map_err(|_| FolioError::Other("write queue is stopped".into()))?;
        queue::await_reply(rx)
    }

    /// Stop watching the data directory. Inflight mutations continue.
    pub fn stop(&self) {
        if self.watcher.lock().unwrap().take().is_some() {
            log::debug!("File watcher stopped");
        }
    }

    pub(crate) fn attach_watcher(&self, watcher: FileWatcher) {
        *self.watcher.lock().unwrap() = Some(watcher);
    }

    fn apply_size_limit(&self, event: SyncEvent) -> SyncEvent {
        let size = serde_json::to_vec(&event).map(|b| b.len()).unwrap_or(0);
        if size <= self.message_size_limit {
            return event;
        }
        log::debug!(
            "Sync envelope of {size} bytes exceeds limit {}, republishing as refresh",
            self.message_size_limit
        );
        self.refresh_fallback(event)
    }

    /// Shrink an envelope to the minimal locator
    /// `{<key-field>, $entitySet, <publicKey-field>}`.
    fn refresh_fallback(&self, event: SyncEvent) -> SyncEvent {
        let mut locator = serde_json::Map::new();
        if let Some(set) = event.entity_set() {
            locator.insert(
                ENTITY_SET_FIELD.to_string(),
                serde_json::Value::String(set.to_string()),
            );
            for field in [self.schema.key_field(set), self.schema.public_key_field(set)]
                .into_iter()
                .flatten()
            {
                if let Some(value) = event.doc.get(field) {
                    locator.insert(field.to_string(), value.clone());
                }
            }
        }
        SyncEvent {
            action: SyncAction::Refresh,
            doc: serde_json::Value::Object(locator),
        }
    }
}
