use super::{LockEvent, LockWatcher};
use crate::error::AuthorityResult;
use crate::types::LockTarget;
use crate::utils::Clock;

use tokio_util::sync::CancellationToken;

use std::time::SystemTime;

/// Why a monitored connection has to end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A lock matching the connection is in force. Carries the lock message.
    Locked(String),
    /// The certificate the connection was authenticated with expired.
    CertificateExpired,
    /// The caller closed the connection.
    Closed,
}

/// Wait until the connection identified by `targets` must be torn down.
/// Returns immediately if a lock is already in force.
pub async fn monitor_connection(
    watcher: &LockWatcher,
    targets: Vec<LockTarget>,
    expires: SystemTime,
    clock: &dyn Clock,
    closed: CancellationToken,
) -> AuthorityResult<DisconnectReason> {
    // Subscribe before checking so a lock created in between is not missed
    let subscription = watcher.subscribe(targets.clone())?;
    if let Err(e) = watcher.check_lock_in_force(watcher.mode(), &targets) {
        return Ok(DisconnectReason::Locked(e.to_string()));
    }

    let remaining = expires
        .duration_since(clock.now())
        .unwrap_or_default();
    let expiry = tokio::time::sleep(remaining);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = closed.cancelled() => return Ok(DisconnectReason::Closed),
            _ = &mut expiry => return Ok(DisconnectReason::CertificateExpired),
            event = subscription.next() => match event {
                Some(LockEvent::Put(lock)) if lock.is_in_force(clock.now()) => {
                    info!("Terminating connection for [{}]: lock [{}] is in force", lock.target, lock.name);
                    return Ok(DisconnectReason::Locked(lock.in_force_error().to_string()));
                }
                Some(_) => (),
                // The watcher went away, nothing can vouch for the connection
                None => return Ok(DisconnectReason::Closed),
            },
        }
    }
}
