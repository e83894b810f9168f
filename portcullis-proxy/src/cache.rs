//! Short lived client credentials shared between connections of the same
//! identity. At most one request per identity is in flight; later callers
//! wait for it instead of asking the authority again.

use crate::credentials::ClientCredentials;
use crate::error::RequestError;
use crate::key::IdentityKey;

use portcullis::utils::{unix_seconds, Clock};

use serde_derive::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfiguration {
    /// Cached credentials are only reused with more validity than this.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_seconds: u64,
    /// When full, the entry that expires first is evicted.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_safety_margin() -> u64 {
    60
}

fn default_capacity() -> usize {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            safety_margin_seconds: default_safety_margin(),
            capacity: default_capacity(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

type Outcome = Arc<Mutex<Option<Result<ClientCredentials, String>>>>;

/// A request in progress. `done` is cancelled once `outcome` is set.
#[derive(Clone)]
struct InFlight {
    done: CancellationToken,
    outcome: Outcome,
}

#[derive(Default)]
struct State {
    entries: HashMap<IdentityKey, ClientCredentials>,
    in_flight: HashMap<IdentityKey, InFlight>,
}

pub struct CredentialCache {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    margin: Duration,
    capacity: usize,
    sweep_interval: Duration,
}

enum Lookup {
    Hit(ClientCredentials),
    Wait(InFlight),
    Lead(InFlight),
}

/// Resolves the in-flight marker of the request it guards. Dropping it
/// without `finish` (the leader was cancelled or its future dropped)
/// fails the waiters.
struct LeaderGuard<'a> {
    cache: &'a CredentialCache,
    key: &'a IdentityKey,
    in_flight: InFlight,
    finished: bool,
}

impl<'a> LeaderGuard<'a> {
    fn finish(mut self, result: &Result<ClientCredentials, RequestError>) {
        let outcome = match result {
            Ok(creds) => Ok(creds.clone()),
            Err(e) => Err(e.to_string()),
        };
        self.resolve(outcome);
        self.finished = true;
    }

    fn resolve(&self, outcome: Result<ClientCredentials, String>) {
        {
            let mut state = self.cache.lock();
            if let Ok(creds) = &outcome {
                self.cache.insert(&mut state, self.key.clone(), creds.clone());
            }
            state.in_flight.remove(self.key);
        }
        *lock_outcome(&self.in_flight.outcome) = Some(outcome);
        self.in_flight.done.cancel();
    }
}

impl<'a> Drop for LeaderGuard<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.resolve(Err("the request was abandoned".to_string()));
        }
    }
}

fn lock_outcome(
    outcome: &Outcome,
) -> MutexGuard<'_, Option<Result<ClientCredentials, String>>> {
    outcome.lock().unwrap_or_else(|e| e.into_inner())
}

impl CredentialCache {
    pub fn new(config: &CacheConfiguration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            margin: Duration::from_secs(config.safety_margin_seconds),
            capacity: config.capacity.max(1),
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state is consistent after every critical section
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> u64 {
        unix_seconds(self.clock.now())
    }

    fn insert(&self, state: &mut State, key: IdentityKey, creds: ClientCredentials) {
        if state.entries.len() >= self.capacity && !state.entries.contains_key(&key) {
            let earliest = state
                .entries
                .iter()
                .min_by_key(|(_, c)| c.not_after)
                .map(|(k, _)| k.clone());
            if let Some(earliest) = earliest {
                debug!("Credential cache is full, evicting [{}]", earliest.username);
                state.entries.remove(&earliest);
            }
        }
        state.entries.insert(key, creds);
    }

    /// Check-or-insert, the only work done under the lock.
    fn lookup(&self, key: &IdentityKey) -> Lookup {
        let now = self.now();
        let mut state = self.lock();
        if let Some(creds) = state.entries.get(key) {
            if creds.is_valid_for(now, self.margin) {
                return Lookup::Hit(creds.clone());
            }
            state.entries.remove(key);
        }
        if let Some(in_flight) = state.in_flight.get(key) {
            return Lookup::Wait(in_flight.clone());
        }
        let in_flight = InFlight {
            done: CancellationToken::new(),
            outcome: Arc::new(Mutex::new(None)),
        };
        state.in_flight.insert(key.clone(), in_flight.clone());
        Lookup::Lead(in_flight)
    }

    /// Cached credentials for `key`, or the result of `request`. Concurrent
    /// callers with the same key share one request. `cancel` only stops
    /// this caller from waiting.
    pub async fn get_or_request<F, Fut>(
        &self,
        key: &IdentityKey,
        cancel: &CancellationToken,
        request: F,
    ) -> Result<ClientCredentials, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ClientCredentials, RequestError>>,
    {
        match self.lookup(key) {
            Lookup::Hit(creds) => Ok(creds),
            Lookup::Wait(in_flight) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RequestError::Canceled),
                    _ = in_flight.done.cancelled() => (),
                }
                let outcome = lock_outcome(&in_flight.outcome).clone();
                match outcome {
                    Some(Ok(creds)) => Ok(creds),
                    Some(Err(e)) => Err(RequestError::CoalescedRequestFailed(e)),
                    None => Err(RequestError::CoalescedRequestFailed(
                        "the request finished without a result".to_string(),
                    )),
                }
            }
            Lookup::Lead(in_flight) => {
                let guard = LeaderGuard {
                    cache: self,
                    key,
                    in_flight,
                    finished: false,
                };
                let result = tokio::select! {
                    // Dropping the guard fails anyone waiting on us
                    _ = cancel.cancelled() => return Err(RequestError::Canceled),
                    result = request() => result,
                };
                if let Err(e) = &result {
                    warn!("Credential request for [{}] failed: {}", key.username, e);
                }
                guard.finish(&result);
                result
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry that can no longer be handed out. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let mut state = self.lock();
        let before = state.entries.len();
        let margin = self.margin;
        state
            .entries
            .retain(|_, creds| creds.is_valid_for(now, margin));
        before - state.entries.len()
    }

    /// Sweep every `sweep_interval_seconds` until `stop` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!("Swept {} expired credentials", removed);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis::error::AuthorityError;
    use portcullis::utils::FakeClock;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn key(user: &str) -> IdentityKey {
        IdentityKey {
            teleport_cluster: "root.local".to_string(),
            route_to_cluster: "root.local".to_string(),
            username: user.to_string(),
            kubernetes_cluster: "prod".to_string(),
            kubernetes_users: vec![],
            kubernetes_groups: vec!["viewers".to_string()],
            active_requests: vec![],
            groups: vec!["dev".to_string()],
            principals: vec![user.to_string()],
            private_key_policy: Default::default(),
            mfa_verified: String::new(),
            pinned_ip: String::new(),
            expires: 0,
        }
    }

    fn creds(not_after: u64) -> ClientCredentials {
        ClientCredentials {
            cert_pem: format!("cert-{}", not_after),
            private_key_pem: "key".to_string(),
            ca_pems: vec![],
            not_after,
        }
    }

    fn cache(capacity: usize) -> (Arc<CredentialCache>, FakeClock, u64) {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = FakeClock::new(start);
        let config = CacheConfiguration {
            capacity,
            ..Default::default()
        };
        let cache = Arc::new(CredentialCache::new(&config, Arc::new(clock.clone())));
        (cache, clock, 1_000_000)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_request() {
        let (cache, _, now) = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = vec![];
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_request(&key("alice"), &CancellationToken::new(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(creds(now + 3600))
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), creds(now + 3600));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn credentials_near_expiry_are_replaced() {
        let (cache, clock, now) = cache(10);
        let cancel = CancellationToken::new();
        cache
            .get_or_request(&key("alice"), &cancel, || async { Ok(creds(now + 120)) })
            .await
            .unwrap();

        // Still more than a minute left
        let hit = cache
            .get_or_request(&key("alice"), &cancel, || async { Ok(creds(now + 999)) })
            .await
            .unwrap();
        assert_eq!(hit.not_after, now + 120);

        clock.advance(Duration::from_secs(60));
        let fresh = cache
            .get_or_request(&key("alice"), &cancel, || async { Ok(creds(now + 999)) })
            .await
            .unwrap();
        assert_eq!(fresh.not_after, now + 999);
    }

    #[tokio::test]
    async fn waiters_can_give_up() {
        let (cache, _, now) = cache(10);
        let release = CancellationToken::new();

        let leader = {
            let cache = cache.clone();
            let release = release.clone();
            tokio::spawn(async move {
                cache
                    .get_or_request(&key("alice"), &CancellationToken::new(), || async move {
                        release.cancelled().await;
                        Ok(creds(now + 3600))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache
            .get_or_request(&key("alice"), &cancel, || async { Ok(creds(now + 1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Canceled));

        release.cancel();
        leader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waiters_see_the_leaders_failure() {
        let (cache, _, now) = cache(10);
        let release = CancellationToken::new();

        let leader = {
            let cache = cache.clone();
            let release = release.clone();
            tokio::spawn(async move {
                cache
                    .get_or_request(&key("alice"), &CancellationToken::new(), || async move {
                        release.cancelled().await;
                        Err(RequestError::Authority(AuthorityError::access_denied(
                            "lock targeting user:\"alice\" is in force",
                        )))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_request(&key("alice"), &CancellationToken::new(), || async move {
                        Ok(creds(now + 3600))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.cancel();

        assert!(matches!(
            leader.await.unwrap().unwrap_err(),
            RequestError::Authority(_)
        ));
        match waiter.await.unwrap().unwrap_err() {
            RequestError::CoalescedRequestFailed(msg) => assert!(msg.contains("is in force")),
            other => panic!("unexpected error: {}", other),
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn a_cancelled_leader_releases_the_key() {
        let (cache, _, now) = cache(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache
            .get_or_request(&key("alice"), &cancel, || async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(creds(now + 3600))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Canceled));

        // The next caller leads a new request instead of waiting forever
        let got = cache
            .get_or_request(&key("alice"), &CancellationToken::new(), || async move {
                Ok(creds(now + 3600))
            })
            .await
            .unwrap();
        assert_eq!(got.not_after, now + 3600);
    }

    #[tokio::test]
    async fn eviction_removes_the_earliest_expiry() {
        let (cache, _, now) = cache(2);
        let cancel = CancellationToken::new();
        cache
            .get_or_request(&key("early"), &cancel, || async { Ok(creds(now + 600)) })
            .await
            .unwrap();
        cache
            .get_or_request(&key("late"), &cancel, || async { Ok(creds(now + 7200)) })
            .await
            .unwrap();
        // Recently used, but still the first to expire
        cache
            .get_or_request(&key("early"), &cancel, || async { Ok(creds(now + 1)) })
            .await
            .unwrap();
        cache
            .get_or_request(&key("new"), &cancel, || async { Ok(creds(now + 3600)) })
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        let refetched = cache
            .get_or_request(&key("early"), &cancel, || async { Ok(creds(now + 900)) })
            .await
            .unwrap();
        assert_eq!(refetched.not_after, now + 900);
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let (cache, clock, now) = cache(10);
        let cancel = CancellationToken::new();
        cache
            .get_or_request(&key("alice"), &cancel, || async { Ok(creds(now + 100)) })
            .await
            .unwrap();
        cache
            .get_or_request(&key("bob"), &cancel, || async { Ok(creds(now + 7200)) })
            .await
            .unwrap();

        clock.advance(Duration::from_secs(50));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn the_sweeper_runs_on_the_configured_interval() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = FakeClock::new(start);
        let config = CacheConfiguration {
            sweep_interval_seconds: 1,
            ..Default::default()
        };
        let cache = Arc::new(CredentialCache::new(&config, Arc::new(clock.clone())));
        cache
            .get_or_request(&key("alice"), &CancellationToken::new(), || async {
                Ok(creds(1_000_100))
            })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(50));

        let stop = CancellationToken::new();
        let sweeper = cache.clone().spawn_sweeper(stop.clone());
        for _ in 0..50 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(cache.is_empty());
        stop.cancel();
        sweeper.await.unwrap();
    }
}
