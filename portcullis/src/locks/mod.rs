//! An in-memory view of the cluster's locks, kept current by a background
//! task watching the backend. Checks against the view never perform I/O.

mod monitor;

pub use monitor::{monitor_connection, DisconnectReason};

use crate::backend::{self, Backend, OpType};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{Lock, LockTarget, LockingMode};
use crate::utils::Clock;

use serde::Deserialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct LockWatcherConfiguration {
    #[serde(default)]
    pub mode: LockingMode,
    /// First delay before re-syncing after the stream fails. Doubles on
    /// each consecutive failure.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_max_retry_ms")]
    pub max_retry_ms: u64,
}

fn default_retry_ms() -> u64 {
    100
}

fn default_max_retry_ms() -> u64 {
    10_000
}

impl Default for LockWatcherConfiguration {
    fn default() -> Self {
        Self {
            mode: LockingMode::default(),
            retry_ms: default_retry_ms(),
            max_retry_ms: default_max_retry_ms(),
        }
    }
}

/// A change to a lock delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum LockEvent {
    Put(Lock),
    /// Carries the lock as it was last seen.
    Delete(Lock),
}

impl LockEvent {
    pub fn lock(&self) -> &Lock {
        match self {
            LockEvent::Put(lock) | LockEvent::Delete(lock) => lock,
        }
    }
}

/// Locks by name, indexed by every target field they set.
#[derive(Default)]
struct LockIndex {
    locks: HashMap<String, Lock>,
    by_field: HashMap<(&'static str, String), HashSet<String>>,
}

impl LockIndex {
    fn insert(&mut self, lock: Lock) -> Option<Lock> {
        let previous = self.remove(&lock.name);
        for (field, value) in lock.target.fields() {
            self.by_field
                .entry((field, value.to_string()))
                .or_default()
                .insert(lock.name.clone());
        }
        self.locks.insert(lock.name.clone(), lock);
        previous
    }

    fn remove(&mut self, name: &str) -> Option<Lock> {
        let lock = self.locks.remove(name)?;
        for (field, value) in lock.target.fields() {
            let key = (field, value.to_string());
            if let Some(names) = self.by_field.get_mut(&key) {
                names.remove(name);
                if names.is_empty() {
                    self.by_field.remove(&key);
                }
            }
        }
        Some(lock)
    }

    /// Locks whose target matches `target`, in no particular order.
    fn matching<'a>(&'a self, target: &LockTarget) -> impl Iterator<Item = &'a Lock> + 'a {
        let mut names = HashSet::new();
        for (field, value) in target.fields() {
            if let Some(found) = self.by_field.get(&(field, value.to_string())) {
                names.extend(found.iter().cloned());
            }
        }
        let target = target.clone();
        names
            .into_iter()
            .filter_map(move |name| self.locks.get(&name))
            .filter(move |lock| lock.target.matches(&target))
    }
}

struct Subscriber {
    targets: Vec<LockTarget>,
    sender: UnboundedSender<LockEvent>,
}

struct Inner {
    index: RwLock<LockIndex>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    synced: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
    mode: LockingMode,
}

impl Inner {
    fn notify(&self, event: LockEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(s) => s,
            Err(e) => {
                error!("Lock subscriber list is poisoned: {}", e);
                return;
            }
        };
        subscribers.retain(|_, subscriber| {
            let interested = subscriber
                .targets
                .iter()
                .any(|t| event.lock().target.matches(t));
            if !interested {
                return !subscriber.sender.is_closed();
            }
            subscriber.sender.send(event.clone()).is_ok()
        });
    }

    fn apply_put(&self, lock: Lock) -> AuthorityResult<()> {
        let previous = self.write_index()?.insert(lock.clone());
        if previous.as_ref() != Some(&lock) {
            self.notify(LockEvent::Put(lock));
        }
        Ok(())
    }

    fn apply_delete(&self, name: &str) -> AuthorityResult<()> {
        if let Some(lock) = self.write_index()?.remove(name) {
            self.notify(LockEvent::Delete(lock));
        }
        Ok(())
    }

    /// Replace the whole view, telling subscribers what changed while the
    /// stream was down.
    fn replace_all(&self, locks: Vec<Lock>) -> AuthorityResult<()> {
        let mut events = vec![];
        {
            let mut index = self.write_index()?;
            let current: HashSet<String> = locks.iter().map(|l| l.name.clone()).collect();
            let stale: Vec<String> = index
                .locks
                .keys()
                .filter(|name| !current.contains(*name))
                .cloned()
                .collect();
            for name in stale {
                if let Some(lock) = index.remove(&name) {
                    events.push(LockEvent::Delete(lock));
                }
            }
            for lock in locks {
                if index.insert(lock.clone()).as_ref() != Some(&lock) {
                    events.push(LockEvent::Put(lock));
                }
            }
        }
        for event in events {
            self.notify(event);
        }
        Ok(())
    }

    fn write_index(&self) -> AuthorityResult<std::sync::RwLockWriteGuard<'_, LockIndex>> {
        self.index
            .write()
            .map_err(|e| AuthorityError::Backend(format!("lock index is poisoned: {}", e)))
    }
}

fn lock_name(key: &str) -> &str {
    key.trim_start_matches("locks/")
}

fn parse_lock(value: &[u8]) -> AuthorityResult<Lock> {
    Ok(serde_json::from_slice(value)?)
}

/// Keeps the lock view and hands out subscriptions. Dropping the watcher
/// does not stop it, call `close`.
pub struct LockWatcher {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LockWatcher {
    /// Start watching. The view is empty until the first sync completes,
    /// see `wait_for_sync`.
    pub fn new(backend: Arc<dyn Backend>, config: LockWatcherConfiguration, clock: Arc<dyn Clock>) -> Self {
        let (synced, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            index: RwLock::new(LockIndex::default()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            synced,
            clock,
            mode: config.mode,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(inner.clone(), backend, config, cancel.clone()));
        Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// The locking mode this watcher was configured with.
    pub fn mode(&self) -> LockingMode {
        self.inner.mode
    }

    pub fn is_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Wait until the view reflects the backend.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.inner.synced.subscribe();
        while !*synced.borrow_and_update() {
            if synced.changed().await.is_err() {
                return;
            }
        }
    }

    /// Return the error of the first lock in force for any of `targets`.
    /// In strict mode every request is denied while the view is stale.
    pub fn check_lock_in_force(&self, mode: LockingMode, targets: &[LockTarget]) -> AuthorityResult<()> {
        if mode == LockingMode::Strict && !self.is_synced() {
            return Err(AuthorityError::access_denied(
                "cannot verify locks are not in force while the lock view is stale",
            ));
        }
        let now = self.inner.clock.now();
        let index = self
            .inner
            .index
            .read()
            .map_err(|e| AuthorityError::Backend(format!("lock index is poisoned: {}", e)))?;
        for target in targets.iter().filter(|t| !t.is_empty()) {
            if let Some(lock) = index.matching(target).find(|l| l.is_in_force(now)) {
                return Err(lock.in_force_error());
            }
        }
        Ok(())
    }

    /// Every lock currently in force that matches one of `targets`.
    pub fn get_locks_in_force(&self, targets: &[LockTarget]) -> Vec<Lock> {
        let now = self.inner.clock.now();
        let index = match self.inner.index.read() {
            Ok(index) => index,
            Err(_) => return vec![],
        };
        let mut found: HashMap<String, Lock> = HashMap::new();
        for target in targets {
            for lock in index.matching(target).filter(|l| l.is_in_force(now)) {
                found.insert(lock.name.clone(), lock.clone());
            }
        }
        found.into_values().collect()
    }

    /// Receive put and delete events, in order, for locks matching any of
    /// `targets`.
    pub fn subscribe(&self, targets: Vec<LockTarget>) -> AuthorityResult<LockSubscription> {
        if targets.is_empty() || targets.iter().any(|t| t.is_empty()) {
            return Err(AuthorityError::bad_parameter(
                "lock subscriptions need at least one non-empty target",
            ));
        }
        let (sender, receiver) = unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .map_err(|e| AuthorityError::Backend(format!("lock subscriber list is poisoned: {}", e)))?
            .insert(id, Subscriber { targets, sender });
        Ok(LockSubscription {
            id,
            receiver: tokio::sync::Mutex::new(receiver),
            done: self.cancel.child_token(),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Stop the background task and end every subscription.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Lock watcher task failed: {}", e);
            }
        }
    }
}

/// A stream of lock events for a set of targets. `close` may be called from
/// any task and wakes a pending `next`.
pub struct LockSubscription {
    id: u64,
    receiver: tokio::sync::Mutex<UnboundedReceiver<LockEvent>>,
    done: CancellationToken,
    inner: std::sync::Weak<Inner>,
}

impl LockSubscription {
    /// The next event, or None once the subscription is closed.
    pub async fn next(&self) -> Option<LockEvent> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            _ = self.done.cancelled() => None,
            event = receiver.recv() => event,
        }
    }

    pub fn close(&self) {
        self.done.cancel();
        if let Some(inner) = self.inner.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.remove(&self.id);
            }
        }
    }
}

impl Drop for LockSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    inner: Arc<Inner>,
    backend: Arc<dyn Backend>,
    config: LockWatcherConfiguration,
    cancel: CancellationToken,
) {
    let initial = Duration::from_millis(config.retry_ms.max(1));
    let max = Duration::from_millis(config.max_retry_ms.max(config.retry_ms));
    let mut backoff = initial;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = sync_and_watch(&inner, backend.as_ref(), &mut backoff, initial) => r,
        };
        inner.synced.send_replace(false);
        match result {
            Ok(()) => warn!("Lock stream ended, re-syncing in {:?}", backoff),
            Err(e) => warn!("Lock watcher failed, re-syncing in {:?}: {}", backoff, e),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => (),
        }
        backoff = (backoff * 2).min(max);
    }
    inner.synced.send_replace(false);
    debug!("Lock watcher has stopped");
}

/// Load every lock then apply events until the stream ends.
async fn sync_and_watch(
    inner: &Inner,
    backend: &dyn Backend,
    backoff: &mut Duration,
    initial: Duration,
) -> AuthorityResult<()> {
    let prefix = format!("{}/", backend::key(&["locks"]));
    // Register before loading so nothing written in between is missed
    let mut watcher = backend.new_watcher(&prefix).await?;
    match watcher.next().await {
        Some(event) if event.op == OpType::Init => (),
        Some(_) => {
            return Err(AuthorityError::Backend(
                "lock stream did not start with an init event".to_string(),
            ))
        }
        None => return Ok(()),
    }

    let mut locks = vec![];
    for item in backend.get_range(&prefix).await? {
        match parse_lock(&item.value) {
            Ok(lock) => locks.push(lock),
            Err(e) => warn!("Skipping malformed lock [{}]: {}", item.key, e),
        }
    }
    inner.replace_all(locks)?;
    inner.synced.send_replace(true);
    *backoff = initial;
    debug!("Lock view is in sync");

    while let Some(event) = watcher.next().await {
        match event.op {
            OpType::Put => match parse_lock(&event.item.value) {
                Ok(lock) => inner.apply_put(lock)?,
                Err(e) => warn!("Skipping malformed lock [{}]: {}", event.item.key, e),
            },
            OpType::Delete => inner.apply_delete(lock_name(&event.item.key))?,
            OpType::Init => (),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::services::{LockService, LockStore};
    use crate::utils::{from_unix_seconds, system_clock, FakeClock};

    fn watcher(backend: Arc<MemoryBackend>, config: LockWatcherConfiguration) -> LockWatcher {
        LockWatcher::new(backend, config, system_clock())
    }

    #[tokio::test]
    async fn subscribers_see_puts_and_deletes_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = LockService::new(backend.clone());
        let watcher = watcher(backend.clone(), LockWatcherConfiguration::default());
        watcher.wait_for_sync().await;

        let sub = watcher.subscribe(vec![LockTarget::user("alice")]).unwrap();
        locks
            .upsert_lock(&Lock::new("other", LockTarget::user("bob")))
            .await
            .unwrap();
        let lock = Lock::new("l1", LockTarget::user("alice")).with_message("offboarded");
        locks.upsert_lock(&lock).await.unwrap();
        locks.delete_lock("l1").await.unwrap();

        assert_eq!(sub.next().await, Some(LockEvent::Put(lock.clone())));
        assert_eq!(sub.next().await, Some(LockEvent::Delete(lock)));
        watcher.close().await;
    }

    #[tokio::test]
    async fn checks_use_the_local_view() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = LockService::new(backend.clone());
        locks
            .upsert_lock(&Lock::new("l1", LockTarget::role("contractor")).with_message("paused"))
            .await
            .unwrap();
        let watcher = watcher(backend.clone(), LockWatcherConfiguration::default());
        watcher.wait_for_sync().await;

        let targets = [LockTarget::user("alice"), LockTarget::role("contractor")];
        let err = watcher
            .check_lock_in_force(LockingMode::BestEffort, &targets)
            .unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(err.to_string(), "lock targeting role:\"contractor\" is in force: paused");
        assert!(watcher
            .check_lock_in_force(LockingMode::BestEffort, &[LockTarget::role("dev")])
            .is_ok());
        watcher.close().await;
    }

    #[tokio::test]
    async fn expired_locks_are_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = FakeClock::new(from_unix_seconds(1_000));
        let locks = LockService::new(backend.clone());
        locks
            .upsert_lock(
                &Lock::new("l1", LockTarget::user("alice")).with_expiry(from_unix_seconds(1_010)),
            )
            .await
            .unwrap();
        let watcher = LockWatcher::new(
            backend.clone(),
            LockWatcherConfiguration::default(),
            Arc::new(clock.clone()),
        );
        watcher.wait_for_sync().await;

        let targets = [LockTarget::user("alice")];
        assert!(watcher.check_lock_in_force(LockingMode::BestEffort, &targets).is_err());
        clock.advance(Duration::from_secs(10));
        assert!(watcher.check_lock_in_force(LockingMode::BestEffort, &targets).is_ok());
        watcher.close().await;
    }

    #[tokio::test]
    async fn lost_streams_are_resynced() {
        let backend = Arc::new(MemoryBackend::new());
        let locks = LockService::new(backend.clone());
        let watcher = watcher(
            backend.clone(),
            LockWatcherConfiguration {
                retry_ms: 10,
                ..Default::default()
            },
        );
        watcher.wait_for_sync().await;
        let sub = watcher.subscribe(vec![LockTarget::user("alice")]).unwrap();

        backend.close_watchers();
        // Written while the watcher has no stream
        let lock = Lock::new("l1", LockTarget::user("alice"));
        locks.upsert_lock(&lock).await.unwrap();

        assert_eq!(sub.next().await, Some(LockEvent::Put(lock)));
        watcher.wait_for_sync().await;
        assert!(watcher
            .check_lock_in_force(LockingMode::Strict, &[LockTarget::user("alice")])
            .is_err());
        watcher.close().await;
    }

    #[tokio::test]
    async fn strict_mode_denies_while_stale() {
        let backend = Arc::new(MemoryBackend::new());
        let watcher = watcher(backend.clone(), LockWatcherConfiguration::default());
        watcher.close().await;
        let targets = [LockTarget::user("alice")];
        assert!(watcher.check_lock_in_force(LockingMode::Strict, &targets).is_err());
        assert!(watcher.check_lock_in_force(LockingMode::BestEffort, &targets).is_ok());
    }

    #[tokio::test]
    async fn close_wakes_a_pending_receiver() {
        let backend = Arc::new(MemoryBackend::new());
        let watcher = watcher(backend.clone(), LockWatcherConfiguration::default());
        let sub = Arc::new(watcher.subscribe(vec![LockTarget::user("alice")]).unwrap());

        let waiting = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.close();
        assert_eq!(waiting.await.unwrap(), None);
        watcher.close().await;
    }

    #[test]
    fn multi_field_locks_need_every_field() {
        let mut index = LockIndex::default();
        let mut target = LockTarget::user("alice");
        target.login = "root".to_string();
        index.insert(Lock::new("l1", target));

        assert_eq!(index.matching(&LockTarget::user("alice")).count(), 0);
        let mut request = LockTarget::user("alice");
        request.login = "root".to_string();
        assert_eq!(index.matching(&request).count(), 1);

        index.remove("l1");
        assert!(index.by_field.is_empty());
    }
}
