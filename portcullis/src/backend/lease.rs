//! A distributed mutual exclusion lock built on `Backend::create`. The
//! lease item carries an expiry so a holder that crashes releases the lock
//! once the TTL passes.

use super::{key, Backend, Item};
use crate::error::{AuthorityError, AuthorityResult};
use crate::utils::{random_id, Clock};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub struct Lease {
    backend: Arc<dyn Backend>,
    key: String,
    token: Vec<u8>,
}

impl Lease {
    pub fn name(&self) -> &str {
        self.key.trim_start_matches("leases/")
    }

    /// Release the lease if we still hold it. A lease that already expired
    /// and was taken by someone else is left alone.
    pub async fn release(self) -> AuthorityResult<()> {
        let current = match self.backend.get(&self.key).await {
            Ok(item) => item,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if current.value != self.token {
            warn!("Lease [{}] expired before it was released", self.key);
            return Ok(());
        }
        match self.backend.delete(&self.key).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}

/// Try once to take the named lease. Returns AlreadyExists if another holder
/// has it.
pub async fn acquire_lease(
    backend: Arc<dyn Backend>,
    name: &str,
    ttl: Duration,
    clock: &dyn Clock,
) -> AuthorityResult<Lease> {
    if name.is_empty() {
        return Err(AuthorityError::bad_parameter("missing lease name"));
    }
    let key = key(&["leases", name]);
    let token = random_id()?.into_bytes();
    let item = Item::new(key.clone(), token.clone()).with_expiry(clock.now() + ttl);
    backend
        .create(item)
        .await
        .map_err(|e| match e {
            AuthorityError::AlreadyExists(_) => {
                AuthorityError::already_exists(format!("lease {} is held by another instance", name))
            }
            other => other,
        })?;
    debug!("Acquired lease [{}] for {:?}", name, ttl);
    Ok(Lease {
        backend,
        key,
        token,
    })
}

/// Run `f` while holding the named lease, retrying acquisition up to
/// `attempts` times with `retry` between tries. The lease is released
/// whether `f` succeeds or not.
pub async fn run_while_locked<F, Fut, T>(
    backend: Arc<dyn Backend>,
    name: &str,
    ttl: Duration,
    clock: &dyn Clock,
    retry: Duration,
    attempts: usize,
    f: F,
) -> AuthorityResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AuthorityResult<T>>,
{
    let mut attempt = 0;
    let lease = loop {
        attempt += 1;
        match acquire_lease(backend.clone(), name, ttl, clock).await {
            Ok(lease) => break lease,
            Err(e) if e.is_already_exists() && attempt < attempts => {
                tokio::time::sleep(retry).await;
            }
            Err(e) => return Err(e),
        }
    };

    let result = f().await;
    if let Err(e) = lease.release().await {
        error!("Could not release lease [{}]: {}", name, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::utils::{from_unix_seconds, FakeClock};

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let clock = FakeClock::new(from_unix_seconds(10_000));
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));

        let lease = acquire_lease(backend.clone(), "rotation", Duration::from_secs(30), &clock)
            .await
            .unwrap();
        let err = acquire_lease(backend.clone(), "rotation", Duration::from_secs(30), &clock)
            .await
            .err()
            .unwrap();
        assert!(err.is_already_exists());

        lease.release().await.unwrap();
        assert!(acquire_lease(backend, "rotation", Duration::from_secs(30), &clock)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn crashed_holder_is_released_by_expiry() {
        let clock = FakeClock::new(from_unix_seconds(10_000));
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));

        let abandoned = acquire_lease(backend.clone(), "rotation", Duration::from_secs(30), &clock)
            .await
            .unwrap();
        std::mem::forget(abandoned);

        clock.advance(Duration::from_secs(31));
        assert!(acquire_lease(backend, "rotation", Duration::from_secs(30), &clock)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn run_while_locked_releases_on_error() {
        let clock = FakeClock::new(from_unix_seconds(10_000));
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));

        let result: AuthorityResult<()> = run_while_locked(
            backend.clone(),
            "rotation",
            Duration::from_secs(30),
            &clock,
            Duration::from_millis(1),
            1,
            || async { Err(AuthorityError::compare_failed("lost the race")) },
        )
        .await;
        assert!(result.unwrap_err().is_compare_failed());
        assert!(backend.get("leases/rotation").await.unwrap_err().is_not_found());
    }
}
