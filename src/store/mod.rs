use crate::codec;
use crate::document::{self, Document, Value, ENTITY_SET_FIELD};
use crate::error::{FolioError, Result};
use crate::index::{MemoryIndex, UpdateOptions, UpdateOutcome};
use crate::query::{Query, QueryMatcher};
use crate::queue::{self, Op, WriteQueue};
use crate::schema::{SchemaView, StorageMode};
use crate::sync::{SyncAction, SyncChannel, SyncEvent};
use crate::transaction::{SelfWriteLog, TransactionEngine};
use crate::watcher::FileWatcher;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Provider configuration.
pub struct StoreOptions {
    pub data_directory: PathBuf,
    /// Watcher events within this window of one of our own writes to the
    /// same document path are ignored.
    pub self_write_skip_threshold: Duration,
    /// Sync envelopes above this size are republished as `refresh` locators.
    pub message_size_limit: usize,
}

impl StoreOptions {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        StoreOptions {
            data_directory: data_directory.into(),
            self_write_skip_threshold: Duration::from_millis(1000),
            message_size_limit: 64 * 1024,
        }
    }
}

/// The main entry point. Opens a data directory, recovers interrupted
/// commits, hydrates the in-memory index, and serializes every operation
/// through a single write queue so the filesystem sees a total order.
pub struct DocumentStore {
    root: PathBuf,
    schema: Arc<SchemaView>,
    queue: WriteQueue,
    sync: Arc<SyncChannel>,
}

impl DocumentStore {
    /// Open a store: run recovery cleanup, hydrate the index from disk,
    /// start the write-queue worker and the file watcher.
    pub fn open(
        options: StoreOptions,
        schema: SchemaView,
        matcher: QueryMatcher,
    ) -> Result<Self> {
        // Resolve to an absolute path so watcher events (which use absolute
        // paths) can be matched back to entity sets via strip_prefix.
        let root = if options.data_directory.is_absolute() {
            options.data_directory.clone()
        } else {
            std::env::current_dir()?.join(&options.data_directory)
        };
        std::fs::create_dir_all(&root)?;

        let schema = Arc::new(schema);
        let self_writes = Arc::new(SelfWriteLog::new(options.self_write_skip_threshold));
        let engine = TransactionEngine::new(root.clone(), Arc::clone(&self_writes));

        let mut index = MemoryIndex::new(Arc::clone(&schema));
        load_all(&schema, &engine, &root, &mut index)?;

        let (tx, rx) = mpsc::channel();
        let sync = Arc::new(SyncChannel::new(
            Arc::clone(&schema),
            options.message_size_limit,
            tx.clone(),
        ));
        let core = Core {
            root: root.clone(),
            schema: Arc::clone(&schema),
            engine,
            index,
            matcher,
            sync: Arc::clone(&sync),
        };
        let queue = WriteQueue::start(core, tx.clone(), rx);

        let mut watched = Vec::new();
        for name in schema.set_names() {
            let mode = schema.mode(&name)?;
            watched.push((name, mode));
        }
        let (watcher, event_rx) =
            match FileWatcher::start(&root, watched, Arc::clone(&self_writes)) {
                Ok(started) => started,
                Err(e) => {
                    let _ = tx.send(Op::Shutdown);
                    return Err(FolioError::Other(format!(
                        "Failed to start file watcher: {e}"
                    )));
                }
            };

        // Forward resolved external changes into the write queue so reloads
        // serialize behind already-accepted local mutations.
        let forward_tx = tx;
        std::thread::spawn(move || {
            while let Ok(change) = event_rx.recv() {
                let op = Op::ExternalChange {
                    set: change.set,
                    public_key: change.public_key,
                };
                if forward_tx.send(op).is_err() {
                    break;
                }
            }
        });
        sync.attach_watcher(watcher);

        log::info!("Opened document store at {}", root.display());
        Ok(DocumentStore {
            root,
            schema,
            queue,
            sync,
        })
    }

    /// Get a handle to an entity set.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        self.schema.set(name)?;
        Ok(Collection {
            store: self,
            name: name.to_string(),
        })
    }

    /// The cross-process synchronization channel.
    pub fn sync(&self) -> &SyncChannel {
        &self.sync
    }

    pub fn schema(&self) -> &SchemaView {
        &self.schema
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-read one document from disk. The locator carries `$entitySet` and
    /// the publicKey field (key field for flat sets). Missing documents are
    /// `NotFound`.
    pub fn reload(&self, locator: &Document) -> Result<Document> {
        let (reply, rx) = mpsc::channel();
        self.queue
            .sender()
            .send(Op::Reload {
                locator: locator.clone(),
                reply,
            })
            .map_err(|_| FolioError::Other("write queue is stopped".into()))?;
        queue::await_reply(rx)
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        self.sync.stop();
        self.queue.shutdown();
    }
}

/// A handle to one entity set. All operations are serialized through the
/// store's write queue, so a `find` enqueued after an `insert` observes it.
pub struct Collection<'a> {
    store: &'a DocumentStore,
    name: String,
}

impl Collection<'_> {
    fn request<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Op) -> Result<T> {
        let (reply, rx) = mpsc::channel();
        self.store
            .queue
            .sender()
            .send(build(reply))
            .map_err(|_| FolioError::Other("write queue is stopped".into()))?;
        queue::await_reply(rx)
    }

    /// Insert a document. The key field is assigned when missing; returns
    /// the stored form.
    pub fn insert(&self, doc: Document) -> Result<Document> {
        self.request(|reply| Op::Insert {
            set: self.name.clone(),
            doc,
            reply,
        })
    }

    /// Apply a patch (plain fields or `$set`) to every match; returns how
    /// many documents changed.
    pub fn update(&self, query: Query, patch: Document) -> Result<usize> {
        self.update_with_options(query, patch, UpdateOptions::default())
    }

    pub fn update_with_options(
        &self,
        query: Query,
        patch: Document,
        options: UpdateOptions,
    ) -> Result<usize> {
        self.request(|reply| Op::Update {
            set: self.name.clone(),
            query,
            patch,
            options,
            reply,
        })
    }

    /// Remove every match; returns how many documents were removed.
    pub fn remove(&self, query: Query) -> Result<usize> {
        self.request(|reply| Op::Remove {
            set: self.name.clone(),
            query,
            reply,
        })
    }

    /// Matching documents, as clones.
    pub fn find(&self, query: Query) -> Result<Vec<Document>> {
        self.request(|reply| Op::Find {
            set: self.name.clone(),
            query,
            reply,
        })
    }

    pub fn count(&self, query: Query) -> Result<usize> {
        self.request(|reply| Op::Count {
            set: self.name.clone(),
            query,
            reply,
        })
    }
}

// ── Worker core ─────────────────────────────────────────────────

/// Owned exclusively by the write-queue worker thread; the only code that
/// mutates the index or touches the transaction engine.
pub(crate) struct Core {
    root: PathBuf,
    schema: Arc<SchemaView>,
    engine: TransactionEngine,
    index: MemoryIndex,
    matcher: QueryMatcher,
    sync: Arc<SyncChannel>,
}

impl Core {
    pub(crate) fn insert(&mut self, set: &str, doc: Document) -> Result<Document> {
        self.schema.set(set)?;
        let snapshot = self.index.snapshot(set);
        let stored = self.index.insert(set, doc)?;
        if let Err(e) = self.persist_insert(set, &stored) {
            self.index.restore(set, snapshot);
            return Err(e);
        }
        self.sync
            .publish(SyncEvent::new(SyncAction::Insert, set, &stored));
        Ok(stored)
    }

    pub(crate) fn update(
        &mut self,
        set: &str,
        query: &Query,
        patch: &Document,
        options: UpdateOptions,
    ) -> Result<usize> {
        self.schema.set(set)?;
        let snapshot = self.index.snapshot(set);
        let outcome = self
            .index
            .update(set, query, patch, options, self.matcher.as_ref())?;

        match outcome {
            UpdateOutcome::Upserted(stored) => {
                if let Err(e) = self.persist_insert(set, &stored) {
                    self.index.restore(set, snapshot);
                    return Err(e);
                }
                self.sync
                    .publish(SyncEvent::new(SyncAction::Insert, set, &stored));
                Ok(1)
            }
            UpdateOutcome::Updated(pairs) => {
                for (before, after) in &pairs {
                    if let Err(e) = self.persist_update(set, before, after) {
                        self.index.restore(set, snapshot);
                        return Err(e);
                    }
                }
                for (_, after) in &pairs {
                    self.sync
                        .publish(SyncEvent::new(SyncAction::Update, set, after));
                }
                Ok(pairs.len())
            }
        }
    }

    pub(crate) fn remove(&mut self, set: &str, query: &Query) -> Result<usize> {
        self.schema.set(set)?;
        let snapshot = self.index.snapshot(set);
        let removed = self.index.remove(set, query, self.matcher.as_ref())?;

        for doc in &removed {
            if let Err(e) = self.persist_remove(set, doc) {
                self.index.restore(set, snapshot);
                return Err(e);
            }
        }
        for doc in &removed {
            self.sync
                .publish(SyncEvent::new(SyncAction::Remove, set, doc));
        }
        Ok(removed.len())
    }

    pub(crate) fn find(&self, set: &str, query: &Query) -> Result<Vec<Document>> {
        self.index.find(set, query, self.matcher.as_ref())
    }

    pub(crate) fn reload(&self, locator: &Document) -> Result<Document> {
        let set = locator
            .get(ENTITY_SET_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| FolioError::Other("reload locator is missing $entitySet".into()))?
            .to_string();
        self.read_from_disk(&set, locator)
    }

    /// Apply an envelope received over the sync channel. In-memory only for
    /// insert/update/remove (the publisher already persisted); refresh and
    /// reload re-read from disk. Never re-publishes.
    pub(crate) fn apply_event(&mut self, event: SyncEvent) -> Result<()> {
        let set = event
            .entity_set()
            .ok_or_else(|| FolioError::Other("sync envelope is missing $entitySet".into()))?
            .to_string();
        self.schema.set(&set)?;

        let obj = match &event.doc {
            serde_json::Value::Object(obj) => obj.clone(),
            _ => {
                return Err(FolioError::Other(
                    "sync envelope doc must be an object".into(),
                ))
            }
        };
        let fields = &self.schema.entity_type(&set)?.fields;
        let mut doc = codec::coerce_object(&self.schema, fields, obj)?;
        doc.remove(ENTITY_SET_FIELD);

        let key_field = self.schema.key_field(&set)?.to_string();
        match event.action {
            SyncAction::Insert => {
                self.index.apply_insert(&set, doc)?;
            }
            SyncAction::Update => {
                self.index.update_by_key(&set, doc)?;
            }
            SyncAction::Remove => {
                let key = doc.get(&key_field).cloned().unwrap_or(Value::Null);
                self.index.remove_by_key(&set, &key)?;
            }
            SyncAction::Refresh | SyncAction::Reload => match self.read_from_disk(&set, &doc) {
                Ok(fresh) => {
                    self.index.apply_insert(&set, fresh)?;
                }
                Err(FolioError::NotFound { .. }) => {
                    let key = doc.get(&key_field).cloned().unwrap_or(Value::Null);
                    self.index.remove_by_key(&set, &key)?;
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }

    /// Converge with a change the watcher observed on disk.
    pub(crate) fn external_change(&mut self, set: &str, public_key: Option<&str>) -> Result<()> {
        self.schema.set(set)?;
        match public_key {
            Some(pk) => {
                let dir = self.root.join(set).join(pk);
                if dir.is_dir() {
                    let doc = codec::decode_directory(&self.schema, set, &dir)?;
                    let stored = self.index.upsert_by_public_key(set, pk, doc)?;
                    self.sync
                        .publish(SyncEvent::new(SyncAction::Reload, set, &stored));
                } else if let Some(removed) = self.index.remove_by_public_key(set, pk)? {
                    self.sync
                        .publish(SyncEvent::new(SyncAction::Remove, set, &removed));
                }
            }
            None => {
                // Flat set: the file is the set, re-read it wholesale.
                let path = self.root.join(set);
                let docs = if path.is_file() {
                    codec::decode_flat(&self.schema, set, &path)?
                } else {
                    Vec::new()
                };
                self.index.load(set, docs)?;
                self.sync
                    .publish(SyncEvent::new(SyncAction::Reload, set, &Document::new()));
            }
        }
        Ok(())
    }

    // ── Disk effects ────────────────────────────────────────────

    fn persist_insert(&self, set: &str, doc: &Document) -> Result<()> {
        match self.schema.mode(set)? {
            StorageMode::Directory => {
                let pk = document::public_key_of(doc, self.schema.public_key_field(set)?)?;
                let files = codec::encode_directory(&self.schema, set, doc)?;
                self.engine.commit_directory(set, None, &pk, &files)
            }
            StorageMode::Flat => self
                .engine
                .append_flat(set, &codec::encode_flat_record(doc)?),
        }
    }

    fn persist_update(&self, set: &str, before: &Document, after: &Document) -> Result<()> {
        match self.schema.mode(set)? {
            StorageMode::Directory => {
                let pk_field = self.schema.public_key_field(set)?;
                let old_pk = document::public_key_of(before, pk_field)?;
                let new_pk = document::public_key_of(after, pk_field)?;
                let files = codec::encode_directory(&self.schema, set, after)?;
                self.engine
                    .commit_directory(set, Some(&old_pk), &new_pk, &files)
            }
            StorageMode::Flat => self
                .engine
                .append_flat(set, &codec::encode_flat_record(after)?),
        }
    }

    fn persist_remove(&self, set: &str, doc: &Document) -> Result<()> {
        match self.schema.mode(set)? {
            StorageMode::Directory => {
                let pk = document::public_key_of(doc, self.schema.public_key_field(set)?)?;
                self.engine.remove_directory(set, &pk)
            }
            StorageMode::Flat => {
                let key_field = self.schema.key_field(set)?;
                let key = doc.get(key_field).cloned().unwrap_or(Value::Null);
                self.engine
                    .append_flat(set, &codec::encode_flat_tombstone(key_field, &key)?)
            }
        }
    }

    fn read_from_disk(&self, set: &str, locator: &Document) -> Result<Document> {
        match self.schema.mode(set)? {
            StorageMode::Directory => {
                let pk_field = self.schema.public_key_field(set)?;
                let pk = locator
                    .get(pk_field)
                    .and_then(Value::as_str)
                    .ok_or_else(|| FolioError::NotFound {
                        set: set.to_string(),
                        id: String::new(),
                    })?
                    .to_string();
                let dir = self.root.join(set).join(&pk);
                if !dir.is_dir() {
                    return Err(FolioError::NotFound {
                        set: set.to_string(),
                        id: pk,
                    });
                }
                codec::decode_directory(&self.schema, set, &dir)
            }
            StorageMode::Flat => {
                let key_field = self.schema.key_field(set)?;
                let path = self.root.join(set);
                let key = locator.get(key_field);
                let id = || {
                    key.and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                if !path.is_file() {
                    return Err(FolioError::NotFound {
                        set: set.to_string(),
                        id: id(),
                    });
                }
                codec::decode_flat(&self.schema, set, &path)?
                    .into_iter()
                    .find(|d| key.is_some() && d.get(key_field) == key)
                    .ok_or_else(|| FolioError::NotFound {
                        set: set.to_string(),
                        id: id(),
                    })
            }
        }
    }
}

// ── Startup loader ──────────────────────────────────────────────

/// Recovery cleanup, then per-set enumeration and decode. Malformed
/// documents are logged and skipped; duplicate publicKeys on disk fail the
/// open.
fn load_all(
    schema: &SchemaView,
    engine: &TransactionEngine,
    root: &Path,
    index: &mut MemoryIndex,
) -> Result<()> {
    for set in schema.set_names() {
        match schema.mode(&set)? {
            StorageMode::Directory => {
                engine.cleanup_set(&set)?;
                let set_dir = root.join(&set);
                let mut docs = Vec::new();
                if set_dir.is_dir() {
                    for entry in std::fs::read_dir(&set_dir)? {
                        let entry = entry?;
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if !entry.path().is_dir() || name.starts_with('.') || name.starts_with('~')
                        {
                            continue;
                        }
                        match codec::decode_directory(schema, &set, &entry.path()) {
                            Ok(doc) => docs.push(doc),
                            Err(e) => log::warn!("Skipping document '{set}/{name}': {e}"),
                        }
                    }
                }
                log::debug!("Loaded {} documents into '{set}'", docs.len());
                index.load(&set, docs)?;
            }
            StorageMode::Flat => {
                let path = root.join(&set);
                let docs = if path.is_file() {
                    codec::decode_flat(schema, &set, &path)?
                } else {
                    Vec::new()
                };
                log::debug!("Loaded {} records into '{set}'", docs.len());
                index.load(&set, docs)?;
            }
        }
    }
    Ok(())
}
