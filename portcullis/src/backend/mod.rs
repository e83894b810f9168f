//! The storage contract the authority is built on: a key-value store with
//! optimistic concurrency and prefix watches. The CA manager, lock watcher
//! and token service only ever talk to this trait.

pub mod lease;
mod memory;
#[cfg(feature = "local-db")]
mod sqlite;

pub use lease::{acquire_lease, run_while_locked, Lease};
pub use memory::MemoryBackend;
#[cfg(feature = "local-db")]
pub use sqlite::SqliteBackend;

use crate::error::AuthorityResult;
use crate::utils::Clock;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use std::sync::Arc;
use std::time::SystemTime;

/// Build a backend key from its components.
pub fn key(parts: &[&str]) -> String {
    parts.join("/")
}

#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    /// Items past this time are treated as absent.
    pub expires: Option<SystemTime>,
}

impl Item {
    pub fn new<K: Into<String>>(key: K, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            expires: None,
        }
    }

    pub fn with_expiry(mut self, expires: SystemTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires, Some(expires) if expires <= now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OpType {
    /// Sent once when the watcher is registered. Everything written after
    /// this event is guaranteed to be delivered.
    Init,
    Put,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Event {
    pub op: OpType,
    /// For deletes only the key is populated.
    pub item: Item,
}

/// A stream of events for keys under a prefix. Dropping or closing the
/// watcher unregisters it on the next write.
pub struct Watcher {
    receiver: UnboundedReceiver<Event>,
}

impl Watcher {
    /// Waits for the next event. `None` means the stream has ended and the
    /// consumer must re-sync.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Fan out bookkeeping shared by the backend implementations.
#[derive(Default)]
pub(crate) struct WatcherSet {
    watchers: Vec<(String, UnboundedSender<Event>)>,
}

impl WatcherSet {
    pub(crate) fn register(&mut self, prefix: &str) -> Watcher {
        let (sender, receiver) = unbounded_channel();
        let init = Event {
            op: OpType::Init,
            item: Item::new(prefix, vec![]),
        };
        // The receiver is alive so this cannot fail
        let _ = sender.send(init);
        self.watchers.push((prefix.to_string(), sender));
        Watcher { receiver }
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.watchers.retain(|(prefix, sender)| {
            if !event.item.key.starts_with(prefix.as_str()) {
                return !sender.is_closed();
            }
            sender.send(event.clone()).is_ok()
        });
    }

    /// Drop every registered watcher, ending their streams.
    pub(crate) fn close_all(&mut self) {
        self.watchers.clear();
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch a single item. Missing and expired items are NotFound.
    async fn get(&self, key: &str) -> AuthorityResult<Item>;

    /// All live items whose key starts with `prefix`, ordered by key.
    async fn get_range(&self, prefix: &str) -> AuthorityResult<Vec<Item>>;

    /// Insert an item that must not already exist (AlreadyExists otherwise).
    async fn create(&self, item: Item) -> AuthorityResult<()>;

    /// Insert or overwrite an item.
    async fn put(&self, item: Item) -> AuthorityResult<()>;

    /// Replace `expected` with `replace` only if the stored value still
    /// equals `expected.value` (CompareFailed otherwise).
    async fn compare_and_swap(&self, expected: &Item, replace: Item) -> AuthorityResult<()>;

    async fn delete(&self, key: &str) -> AuthorityResult<()>;

    async fn new_watcher(&self, prefix: &str) -> AuthorityResult<Watcher>;
}

/// Which backend implementation to open. Exactly one is configured.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfiguration {
    Memory,
    #[cfg(feature = "local-db")]
    Sqlite { path: String },
}

impl Default for BackendConfiguration {
    fn default() -> Self {
        BackendConfiguration::Memory
    }
}

impl BackendConfiguration {
    pub fn open(self, clock: Arc<dyn Clock>) -> AuthorityResult<Arc<dyn Backend>> {
        match self {
            BackendConfiguration::Memory => Ok(Arc::new(MemoryBackend::with_clock(clock))),
            #[cfg(feature = "local-db")]
            BackendConfiguration::Sqlite { path } => {
                Ok(Arc::new(SqliteBackend::open(&path, clock)?))
            }
        }
    }
}
