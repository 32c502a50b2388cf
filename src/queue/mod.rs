use crate::document::Document;
use crate::error::{FolioError, Result};
use crate::index::UpdateOptions;
use crate::query::Query;
use crate::store::Core;
use crate::sync::SyncEvent;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;

/// One message in the provider mailbox. Every operation — mutations, reads,
/// subscribed sync events, watcher reloads — goes through here, so the
/// filesystem and the in-memory index see a single total order.
pub(crate) enum Op {
    Insert {
        set: String,
        doc: Document,
        reply: Sender<Result<Document>>,
    },
    Update {
        set: String,
        query: Query,
        patch: Document,
        options: UpdateOptions,
        reply: Sender<Result<usize>>,
    },
    Remove {
        set: String,
        query: Query,
        reply: Sender<Result<usize>>,
    },
    Find {
        set: String,
        query: Query,
        reply: Sender<Result<Vec<Document>>>,
    },
    Count {
        set: String,
        query: Query,
        reply: Sender<Result<usize>>,
    },
    Reload {
        locator: Document,
        reply: Sender<Result<Document>>,
    },
    Apply {
        event: SyncEvent,
        reply: Sender<Result<()>>,
    },
    ExternalChange {
        set: String,
        public_key: Option<String>,
    },
    Shutdown,
}

/// Single-consumer FIFO over the provider core. The worker thread is the
/// only code that touches the index or the transaction engine.
pub(crate) struct WriteQueue {
    tx: Sender<Op>,
    worker: Option<JoinHandle<()>>,
}

impl WriteQueue {
    pub fn start(core: Core, tx: Sender<Op>, rx: Receiver<Op>) -> Self {
        let worker = std::thread::spawn(move || run(core, rx));
        WriteQueue {
            tx,
            worker: Some(worker),
        }
    }

    pub fn sender(&self) -> Sender<Op> {
        self.tx.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Op::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(mut core: Core, rx: Receiver<Op>) {
    while let Ok(op) = rx.recv() {
        match op {
            Op::Shutdown => break,
            Op::Insert { set, doc, reply } => {
                let _ = reply.send(core.insert(&set, doc));
            }
            Op::Update {
                set,
                query,
                patch,
                options,
                reply,
            } => {
                let _ = reply.send(core.update(&set, &query, &patch, options));
            }
            Op::Remove { set, query, reply } => {
                let _ = reply.send(core.remove(&set, &query));
            }
            Op::Find { set, query, reply } => {
                let _ = reply.send(core.find(&set, &query));
            }
            Op::Count { set, query, reply } => {
                let _ = reply.send(core.find(&set, &query).map(|docs| docs.len()));
            }
            Op::Reload { locator, reply } => {
                let _ = reply.send(core.reload(&locator));
            }
            Op::Apply { event, reply } => {
                let _ = reply.send(core.apply_event(event));
            }
            Op::ExternalChange { set, public_key } => {
                // Fire-and-forget; nobody is waiting on a watcher reload.
                if let Err(e) = core.external_change(&set, public_key.as_deref()) {
                    log::warn!("Failed to apply external change in '{set}': {e}");
                }
            }
        }
    }
}

/// Block until the worker answers; a closed queue reports instead of
/// panicking.
pub(crate) fn await_reply<T>(rx: Receiver<Result<T>>) -> Result<T> {
    rx.recv()
        .unwrap_or_else(|_| Err(FolioError::Other("write queue is stopped".into())))
}
