//! Certificate authority rotation.
//!
//! A rotation moves through `init` (new keys trusted, old keys sign),
//! `update_clients` (new keys sign, old keys still trusted),
//! `update_servers` (no key change, servers reload) and back to `standby`
//! (old keys dropped). A rollback from any in-progress phase makes the old
//! keys active again and keeps the new ones trusted until it completes.

use super::CAManager;
use crate::audit::{AuditEvent, CertAuthorityRotated};
use crate::backend::run_while_locked;
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{
    CAKeySet, CertAuthType, CertAuthority, Rotation, RotationMode, RotationPhase,
    RotationSchedule, RotationState,
};
use crate::utils::{random_id, unix_seconds};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;

const ROTATION_LEASE_TTL: Duration = Duration::from_secs(60);
const ROTATION_LEASE_RETRY: Duration = Duration::from_millis(250);
const ROTATION_LEASE_ATTEMPTS: usize = 20;

#[derive(Clone, Debug)]
pub struct RotateRequest {
    /// Every local authority is rotated when unset.
    pub ca_type: Option<CertAuthType>,
    /// Defaults to starting a rotation from standby, or the next phase of
    /// the rotation in progress.
    pub target_phase: Option<RotationPhase>,
    pub mode: RotationMode,
    /// Overrides the configured grace period when a rotation starts.
    pub grace_period: Option<Duration>,
    /// Overrides the schedule generated from the grace period.
    pub schedule: Option<RotationSchedule>,
}

impl RotateRequest {
    pub fn manual(ca_type: CertAuthType, target_phase: RotationPhase) -> Self {
        Self {
            ca_type: Some(ca_type),
            target_phase: Some(target_phase),
            mode: RotationMode::Manual,
            grace_period: None,
            schedule: None,
        }
    }

    pub fn auto(ca_type: CertAuthType, grace_period: Duration) -> Self {
        Self {
            ca_type: Some(ca_type),
            target_phase: Some(RotationPhase::Init),
            mode: RotationMode::Auto,
            grace_period: Some(grace_period),
            schedule: None,
        }
    }
}

impl CAManager {
    fn rotation_lease(&self) -> String {
        format!("{}/ca-rotation", self.cluster_name)
    }

    /// Move one or every local authority to the requested phase. Runs under
    /// the cluster's rotation lease. A concurrent change to an authority is
    /// returned as CompareFailed for the caller to retry.
    pub async fn rotate(&self, req: RotateRequest) -> AuthorityResult<()> {
        let types = match req.ca_type {
            Some(ca_type) => vec![ca_type],
            None => CertAuthType::ALL.to_vec(),
        };
        let req = &req;
        run_while_locked(
            self.backend.clone(),
            &self.rotation_lease(),
            ROTATION_LEASE_TTL,
            self.clock.as_ref(),
            ROTATION_LEASE_RETRY,
            ROTATION_LEASE_ATTEMPTS,
            move || async move {
                for ca_type in types {
                    self.rotate_authority(ca_type, req).await?;
                }
                Ok(())
            },
        )
        .await
    }

    async fn rotate_authority(&self, ca_type: CertAuthType, req: &RotateRequest) -> AuthorityResult<()> {
        let existing = self.get_local_authority(ca_type).await?;
        let current = existing.rotation.phase;
        let target = match req.target_phase {
            Some(phase) => phase,
            None if current == RotationPhase::Standby => RotationPhase::Init,
            None => current.next().ok_or_else(|| {
                AuthorityError::bad_parameter(format!("{} has no phase after {}", existing.id, current))
            })?,
        };

        if !current.can_transition_to(target) {
            if target == RotationPhase::Init && existing.rotation.is_in_progress() {
                return Err(AuthorityError::bad_parameter(format!(
                    "rotation {} of {} is already in progress",
                    existing.rotation.current_id, existing.id
                )));
            }
            return Err(AuthorityError::bad_parameter(format!(
                "{} cannot move from phase {} to {}",
                existing.id, current, target
            )));
        }

        let now = unix_seconds(self.clock.now());
        let mut updated = existing.clone();
        match target {
            RotationPhase::Init => {
                updated.additional_trusted_keys = self
                    .key_store
                    .new_key_set(ca_type.required_kinds(), &self.cluster_name)
                    .await?;
                updated.rotation = self.start_rotation(&existing, req, now)?;
            }
            RotationPhase::UpdateClients => swap_keys(&mut updated),
            RotationPhase::UpdateServers => (),
            RotationPhase::Rollback => {
                // In init the old keys never stopped signing
                if current != RotationPhase::Init {
                    swap_keys(&mut updated);
                }
            }
            RotationPhase::Standby => {
                updated.additional_trusted_keys = CAKeySet::default();
                let last_rotated = if current == RotationPhase::UpdateServers {
                    now
                } else {
                    existing.rotation.last_rotated
                };
                updated.rotation = Rotation {
                    last_rotated,
                    ..Rotation::default()
                };
            }
        }
        updated.rotation.set_phase(target);
        updated.check_local()?;

        self.trust
            .compare_and_swap_cert_authority(&updated, &existing)
            .await?;

        let rotation_id = if updated.rotation.current_id.is_empty() {
            existing.rotation.current_id.clone()
        } else {
            updated.rotation.current_id.clone()
        };
        info!(
            "{} moved from phase [{}] to [{}] in rotation [{}]",
            existing.id, current, target, rotation_id
        );
        self.audit.emit(AuditEvent::CertAuthorityRotated(CertAuthorityRotated {
            ca_type: ca_type.to_string(),
            domain: existing.id.domain.clone(),
            rotation_id,
            phase: target.to_string(),
        }));
        Ok(())
    }

    fn start_rotation(
        &self,
        existing: &CertAuthority,
        req: &RotateRequest,
        now: u64,
    ) -> AuthorityResult<Rotation> {
        let grace_period_seconds = req
            .grace_period
            .map(|g| g.as_secs())
            .unwrap_or(self.rotation.grace_period_seconds);
        let schedule = match &req.schedule {
            Some(schedule) => {
                schedule.check()?;
                schedule.clone()
            }
            None => RotationSchedule::generate(now, grace_period_seconds),
        };
        Ok(Rotation {
            state: RotationState::InProgress,
            phase: RotationPhase::Init,
            mode: req.mode,
            current_id: random_id()?,
            started: now,
            grace_period_seconds,
            last_rotated: existing.rotation.last_rotated,
            schedule,
        })
    }

    /// Advance every authority in automatic mode whose current phase is
    /// past its scheduled deadline. Only the holder of the rotation lease
    /// does anything; other instances return immediately.
    pub async fn auto_rotate(&self) -> AuthorityResult<()> {
        let result = run_while_locked(
            self.backend.clone(),
            &self.rotation_lease(),
            ROTATION_LEASE_TTL,
            self.clock.as_ref(),
            ROTATION_LEASE_RETRY,
            1,
            move || async move {
                for ca_type in CertAuthType::ALL {
                    self.auto_rotate_authority(ca_type).await?;
                }
                Ok(())
            },
        )
        .await;

        match result {
            Err(e) if e.is_already_exists() => {
                debug!("Rotation lease is held by another instance, skipping this pass");
                Ok(())
            }
            other => other,
        }
    }

    async fn auto_rotate_authority(&self, ca_type: CertAuthType) -> AuthorityResult<()> {
        let ca = match self.get_local_authority(ca_type).await {
            Ok(ca) => ca,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let rotation = &ca.rotation;
        if rotation.mode != RotationMode::Auto || !rotation.is_in_progress() {
            return Ok(());
        }
        let deadline = match rotation.schedule.deadline(rotation.phase) {
            Some(deadline) => deadline,
            None => return Ok(()),
        };
        if unix_seconds(self.clock.now()) < deadline {
            return Ok(());
        }
        let next = match rotation.phase.next() {
            Some(next) => next,
            None => return Ok(()),
        };

        let req = RotateRequest {
            ca_type: Some(ca_type),
            target_phase: Some(next),
            mode: RotationMode::Auto,
            grace_period: None,
            schedule: None,
        };
        match self.rotate_authority(ca_type, &req).await {
            Err(e) if e.is_compare_failed() => {
                warn!("{} changed during automatic rotation, deferring: {}", ca.id, e);
                Ok(())
            }
            other => other,
        }
    }

    /// Run `auto_rotate` every check interval until `cancel` fires.
    pub fn spawn_auto_rotation(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.rotation.check_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.auto_rotate().await {
                            error!("Automatic rotation pass failed: {}", e);
                        }
                    }
                }
            }
            debug!("Automatic rotation has stopped");
        })
    }
}

/// Active keys become additional trusted keys and the other way around.
fn swap_keys(ca: &mut CertAuthority) {
    std::mem::swap(&mut ca.active_keys, &mut ca.additional_trusted_keys);
}

#[cfg(test)]
mod tests {
    use super::super::{MigrationConfiguration, RotationConfiguration};
    use super::*;
    use crate::audit::AuditEmitter;
    use crate::backend::{Backend, MemoryBackend};
    use crate::keystore::KeyStore;
    use crate::services::TrustService;
    use crate::utils::{from_unix_seconds, FakeClock};

    fn manager(clock: FakeClock) -> CAManager {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
        let (audit, _) = AuditEmitter::channel("root.local", Arc::new(clock.clone()));
        CAManager::new(
            "root.local",
            Arc::new(TrustService::new(backend.clone())),
            KeyStore::software(),
            backend,
            Arc::new(clock),
            audit,
            RotationConfiguration::default(),
            MigrationConfiguration::default(),
        )
    }

    fn ssh_keys(keys: &CAKeySet) -> Vec<String> {
        keys.ssh.iter().map(|k| k.public_key.clone()).collect()
    }

    #[tokio::test]
    async fn full_rotation_swaps_then_drops_old_keys() {
        let manager = manager(FakeClock::new(from_unix_seconds(100_000)));
        manager.init().await.unwrap();
        let original = manager.get_local_authority(CertAuthType::User).await.unwrap();
        let old = ssh_keys(&original.active_keys);

        manager
            .rotate(RotateRequest::manual(CertAuthType::User, RotationPhase::Init))
            .await
            .unwrap();
        let init = manager.get_local_authority(CertAuthType::User).await.unwrap();
        assert_eq!(init.rotation.state, RotationState::InProgress);
        assert_eq!(ssh_keys(&init.active_keys), old);
        let new = ssh_keys(&init.additional_trusted_keys);
        assert_eq!(new.len(), 1);
        assert_ne!(new, old);

        manager
            .rotate(RotateRequest::manual(CertAuthType::User, RotationPhase::UpdateClients))
            .await
            .unwrap();
        let clients = manager.get_local_authority(CertAuthType::User).await.unwrap();
        assert_eq!(ssh_keys(&clients.active_keys), new);
        assert_eq!(ssh_keys(&clients.additional_trusted_keys), old);

        manager
            .rotate(RotateRequest::manual(CertAuthType::User, RotationPhase::UpdateServers))
            .await
            .unwrap();
        manager
            .rotate(RotateRequest::manual(CertAuthType::User, RotationPhase::Standby))
            .await
            .unwrap();
        let done = manager.get_local_authority(CertAuthType::User).await.unwrap();
        assert_eq!(ssh_keys(&done.active_keys), new);
        assert!(done.additional_trusted_keys.is_empty());
        assert_eq!(done.rotation.state, RotationState::Standby);
        assert_eq!(done.rotation.last_rotated, 100_000);
    }

    #[tokio::test]
    async fn rollback_restores_the_old_keys() {
        let manager = manager(FakeClock::new(from_unix_seconds(100_000)));
        manager.init().await.unwrap();
        let old = ssh_keys(
            &manager
                .get_local_authority(CertAuthType::Host)
                .await
                .unwrap()
                .active_keys,
        );

        for phase in [RotationPhase::Init, RotationPhase::UpdateClients, RotationPhase::Rollback] {
            manager
                .rotate(RotateRequest::manual(CertAuthType::Host, phase))
                .await
                .unwrap();
        }
        let rollback = manager.get_local_authority(CertAuthType::Host).await.unwrap();
        assert_eq!(rollback.rotation.state, RotationState::Rollback);
        assert_eq!(ssh_keys(&rollback.active_keys), old);
        assert_eq!(rollback.additional_trusted_keys.ssh.len(), 1);

        manager
            .rotate(RotateRequest::manual(CertAuthType::Host, RotationPhase::Standby))
            .await
            .unwrap();
        let done = manager.get_local_authority(CertAuthType::Host).await.unwrap();
        assert_eq!(ssh_keys(&done.active_keys), old);
        assert!(done.additional_trusted_keys.is_empty());
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let manager = manager(FakeClock::new(from_unix_seconds(100_000)));
        manager.init().await.unwrap();

        let err = manager
            .rotate(RotateRequest::manual(CertAuthType::Host, RotationPhase::UpdateServers))
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());

        manager
            .rotate(RotateRequest::manual(CertAuthType::Host, RotationPhase::Init))
            .await
            .unwrap();
        let err = manager
            .rotate(RotateRequest::manual(CertAuthType::Host, RotationPhase::Init))
            .await
            .unwrap_err();
        assert!(err.message().contains("already in progress"));

        // Other authorities are independent
        manager
            .rotate(RotateRequest::manual(CertAuthType::User, RotationPhase::Init))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn automatic_rotation_follows_the_schedule() {
        let clock = FakeClock::new(from_unix_seconds(100_000));
        let manager = manager(clock.clone());
        manager.init().await.unwrap();
        manager
            .rotate(RotateRequest::auto(CertAuthType::Jwt, Duration::from_secs(300)))
            .await
            .unwrap();

        manager.auto_rotate().await.unwrap();
        let ca = manager.get_local_authority(CertAuthType::Jwt).await.unwrap();
        assert_eq!(ca.rotation.phase, RotationPhase::Init);

        let mut seen = vec![];
        for _ in 0..3 {
            clock.advance(Duration::from_secs(100));
            manager.auto_rotate().await.unwrap();
            seen.push(
                manager
                    .get_local_authority(CertAuthType::Jwt)
                    .await
                    .unwrap()
                    .rotation
                    .phase,
            );
        }
        assert_eq!(
            seen,
            vec![
                RotationPhase::UpdateClients,
                RotationPhase::UpdateServers,
                RotationPhase::Standby
            ]
        );
    }
}
