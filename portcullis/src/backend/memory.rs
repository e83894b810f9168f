use super::{Backend, Event, Item, OpType, Watcher, WatcherSet};
use crate::error::{AuthorityError, AuthorityResult};
use crate::utils::{system_clock, Clock};

use async_trait::async_trait;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    items: BTreeMap<String, Item>,
    watchers: WatcherSet,
}

/// A process local backend. Used by tests and single instance deployments
/// that do not need persistence.
///
/// Events are emitted while the state lock is held so every watcher sees
/// writes in the order they were applied.
pub struct MemoryBackend {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn state(&self) -> AuthorityResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| AuthorityError::Backend(format!("memory backend lock poisoned: {}", e)))
    }

    /// Terminate every open watcher stream. Consumers observe the end of the
    /// stream and have to re-sync, which is how they behave when a real
    /// backend connection drops.
    pub fn close_watchers(&self) {
        if let Ok(mut state) = self.state() {
            state.watchers.close_all();
        }
    }

    fn live<'a>(&self, state: &'a State, key: &str) -> Option<&'a Item> {
        let now = self.clock.now();
        state.items.get(key).filter(|item| !item.is_expired(now))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> AuthorityResult<Item> {
        let state = self.state()?;
        self.live(&state, key)
            .cloned()
            .ok_or_else(|| AuthorityError::not_found(format!("key {} is not found", key)))
    }

    async fn get_range(&self, prefix: &str) -> AuthorityResult<Vec<Item>> {
        let state = self.state()?;
        let now = self.clock.now();
        Ok(state
            .items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, item)| !item.is_expired(now))
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn create(&self, item: Item) -> AuthorityResult<()> {
        let mut state = self.state()?;
        if self.live(&state, &item.key).is_some() {
            return Err(AuthorityError::already_exists(format!(
                "key {} already exists",
                item.key
            )));
        }
        state.items.insert(item.key.clone(), item.clone());
        state.watchers.emit(Event {
            op: OpType::Put,
            item,
        });
        Ok(())
    }

    async fn put(&self, item: Item) -> AuthorityResult<()> {
        let mut state = self.state()?;
        state.items.insert(item.key.clone(), item.clone());
        state.watchers.emit(Event {
            op: OpType::Put,
            item,
        });
        Ok(())
    }

    async fn compare_and_swap(&self, expected: &Item, replace: Item) -> AuthorityResult<()> {
        if expected.key != replace.key {
            return Err(AuthorityError::bad_parameter(
                "expected and replacement keys must match",
            ));
        }
        let mut state = self.state()?;
        match self.live(&state, &expected.key) {
            None => {
                return Err(AuthorityError::compare_failed(format!(
                    "key {} does not exist",
                    expected.key
                )))
            }
            Some(current) if current.value != expected.value => {
                return Err(AuthorityError::compare_failed(format!(
                    "key {} was modified concurrently",
                    expected.key
                )))
            }
            Some(_) => (),
        }
        state.items.insert(replace.key.clone(), replace.clone());
        state.watchers.emit(Event {
            op: OpType::Put,
            item: replace,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> AuthorityResult<()> {
        let mut state = self.state()?;
        let existed = self.live(&state, key).is_some();
        state.items.remove(key);
        if !existed {
            return Err(AuthorityError::not_found(format!("key {} is not found", key)));
        }
        state.watchers.emit(Event {
            op: OpType::Delete,
            item: Item::new(key, vec![]),
        });
        Ok(())
    }

    async fn new_watcher(&self, prefix: &str) -> AuthorityResult<Watcher> {
        let mut state = self.state()?;
        Ok(state.watchers.register(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{from_unix_seconds, FakeClock};
    use std::time::Duration;

    #[tokio::test]
    async fn create_refuses_existing_keys() {
        let backend = MemoryBackend::new();
        backend.create(Item::new("a/1", b"one".to_vec())).await.unwrap();
        let err = backend
            .create(Item::new("a/1", b"two".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(backend.get("a/1").await.unwrap().value, b"one".to_vec());
    }

    #[tokio::test]
    async fn compare_and_swap_detects_concurrent_writes() {
        let backend = MemoryBackend::new();
        let original = Item::new("ca/host", b"v1".to_vec());
        backend.create(original.clone()).await.unwrap();
        backend.put(Item::new("ca/host", b"v2".to_vec())).await.unwrap();

        let err = backend
            .compare_and_swap(&original, Item::new("ca/host", b"v3".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());

        let current = backend.get("ca/host").await.unwrap();
        backend
            .compare_and_swap(&current, Item::new("ca/host", b"v3".to_vec()))
            .await
            .unwrap();
        assert_eq!(backend.get("ca/host").await.unwrap().value, b"v3".to_vec());
    }

    #[tokio::test]
    async fn expired_items_are_invisible() {
        let clock = FakeClock::new(from_unix_seconds(1_000));
        let backend = MemoryBackend::with_clock(Arc::new(clock.clone()));
        let item = Item::new("leases/rotation", b"x".to_vec())
            .with_expiry(from_unix_seconds(1_010));
        backend.create(item).await.unwrap();
        assert!(backend.get("leases/rotation").await.is_ok());

        clock.advance(Duration::from_secs(10));
        assert!(backend.get("leases/rotation").await.unwrap_err().is_not_found());
        // An expired item does not block a new create
        backend
            .create(Item::new("leases/rotation", b"y".to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn watchers_receive_prefix_events_in_order() {
        let backend = MemoryBackend::new();
        let mut watcher = backend.new_watcher("locks/").await.unwrap();
        assert_eq!(watcher.next().await.unwrap().op, OpType::Init);

        backend.put(Item::new("locks/a", b"1".to_vec())).await.unwrap();
        backend.put(Item::new("tokens/a", b"1".to_vec())).await.unwrap();
        backend.delete("locks/a").await.unwrap();

        let put = watcher.next().await.unwrap();
        assert_eq!((put.op, put.item.key.as_str()), (OpType::Put, "locks/a"));
        let delete = watcher.next().await.unwrap();
        assert_eq!((delete.op, delete.item.key.as_str()), (OpType::Delete, "locks/a"));
    }

    #[tokio::test]
    async fn get_range_only_returns_the_prefix() {
        let backend = MemoryBackend::new();
        backend.put(Item::new("kube/a", vec![])).await.unwrap();
        backend.put(Item::new("kube/b", vec![])).await.unwrap();
        backend.put(Item::new("kubernetes/c", vec![])).await.unwrap();
        let keys: Vec<String> = backend
            .get_range("kube/")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["kube/a".to_string(), "kube/b".to_string()]);
    }
}
