//! Adding trusted device data to a certificate pair the caller already
//! holds. The caller is not re-authenticated, so both halves are checked
//! against each other and against the authenticated identity before new
//! certificates are signed.

use super::{AuthServer, CLOCK_SKEW};
use crate::audit::{AuditEvent, CertificatesAugmented};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{ssh, tls, DeviceExtensions, Identity};
use crate::types::{CertAuthType, LockTarget};
use crate::utils::{normalized, unix_seconds};

use sshcerts::ssh::CertType;

/// What the caller authenticated with.
pub struct AuthContext {
    /// The identity the caller was authenticated as.
    pub identity: Identity,
    /// The x509 certificate the caller presented, PEM.
    pub tls_cert: String,
}

#[derive(Default)]
pub struct AugmentOptions {
    /// The SSH half of the pair, authorized_keys format. Only the x509
    /// certificate is augmented when absent.
    pub ssh_authorized_key: Option<String>,
    pub device_extensions: Option<DeviceExtensions>,
}

#[derive(Clone, Debug)]
pub struct AugmentedCerts {
    pub ssh: Option<String>,
    pub tls: String,
}

impl AuthServer {
    pub async fn augment_certificates(
        &self,
        ctx: &AuthContext,
        opts: AugmentOptions,
    ) -> AuthorityResult<AugmentedCerts> {
        let device = match opts.device_extensions {
            Some(device) => device,
            None => {
                return Err(AuthorityError::bad_parameter(
                    "at least one extension must be requested",
                ))
            }
        };
        if !device.is_complete() {
            return Err(AuthorityError::bad_parameter(
                "device extensions require a device ID, asset tag and credential ID",
            ));
        }

        let now = self.now();
        let user_ca = self.local_authority(CertAuthType::User).await?;

        let x509 = tls::decode_trusted(&ctx.tls_cert, &user_ca.trusted_tls_certs())?;
        if x509.not_after <= unix_seconds(now) {
            return Err(AuthorityError::access_denied("x509 certificate has expired"));
        }
        if x509.identity.username != ctx.identity.username {
            return Err(AuthorityError::access_denied("x509 user mismatch"));
        }

        let ssh_cert = match &opts.ssh_authorized_key {
            Some(authorized_key) => {
                let decoded =
                    ssh::decode_trusted(authorized_key, &user_ca.trusted_ssh_public_keys()?)?;
                if decoded.cert.cert_type != CertType::User {
                    return Err(AuthorityError::access_denied(
                        "SSH certificate is not a user certificate",
                    ));
                }
                if tls::raw_subject_key(&decoded.cert.key)? != x509.public_key {
                    return Err(AuthorityError::access_denied("public key mismatch"));
                }
                if decoded.identity.username != x509.identity.username {
                    return Err(AuthorityError::access_denied("SSH user mismatch"));
                }
                if normalized(&decoded.identity.principals) != normalized(&x509.identity.principals)
                {
                    return Err(AuthorityError::access_denied("principals mismatch"));
                }
                if decoded.cert.valid_before <= unix_seconds(now) {
                    return Err(AuthorityError::access_denied("SSH certificate has expired"));
                }
                Some(decoded)
            }
            None => None,
        };

        let already_present = tls::has_device_extensions(&x509.identity)
            || ssh_cert
                .as_ref()
                .map(|d| ssh::has_device_extensions(&d.cert))
                .unwrap_or(false);
        if already_present {
            return Err(AuthorityError::access_denied("extensions already present"));
        }

        let targets = vec![
            LockTarget::user(x509.identity.username.as_str()),
            LockTarget::device(device.device_id.as_str()),
        ];
        self.check_locks(&targets)?;

        let tls_signer = self.tls_signer(&user_ca).await?;
        let ssh_signer = if ssh_cert.is_some() {
            Some(self.ssh_signer(&user_ca).await?)
        } else {
            None
        };

        // Locks may have landed while the signers were loaded
        self.check_locks(&targets)?;

        let not_before = now - CLOCK_SKEW;
        let mut tls_identity = x509.identity.clone();
        tls_identity.device_extensions = device.clone();
        let tls_cert = tls::reissue(&tls_signer, &tls_identity, &x509, not_before)?;

        let ssh_out = match (ssh_cert, ssh_signer) {
            (Some(decoded), Some(signer)) => {
                let cert = ssh::reissue_with_device(
                    &signer,
                    &decoded.cert,
                    &device,
                    unix_seconds(not_before),
                )
                .await?;
                Some(cert.to_string())
            }
            _ => None,
        };

        info!(
            "Augmented certificates of [{}] with device [{}]",
            tls_identity.username, device.device_id
        );
        self.audit
            .emit(AuditEvent::CertificatesAugmented(CertificatesAugmented {
                user: tls_identity.username.clone(),
                device_id: device.device_id,
            }));

        Ok(AugmentedCerts {
            ssh: ssh_out,
            tls: tls_cert,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster, public_key, roles, TestCluster};
    use super::super::{UserCerts, UserCertsRequest};
    use super::*;
    use crate::keystore::{GeneratedKey, KeyBackend, KeyStore, Signer, SigningError, SoftwareKeys};
    use crate::locks::LockWatcher;
    use crate::services::LockStore;
    use crate::types::{CertAuthID, Lock, PrivateKeyType};

    use async_trait::async_trait;
    use sshcerts::Certificate;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Software keys that lock `device-1` the first time a signer is
    /// loaded, once the lock watcher has seen the lock.
    struct LockWhileLoading {
        locks: Arc<dyn LockStore>,
        watcher: Arc<LockWatcher>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl KeyBackend for LockWhileLoading {
        fn name(&self) -> &'static str {
            "lock-while-loading"
        }

        async fn generate_key(&self) -> Result<GeneratedKey, SigningError> {
            SoftwareKeys.generate_key().await
        }

        fn can_sign_with(&self, private_key: &[u8], private_key_type: &PrivateKeyType) -> bool {
            SoftwareKeys.can_sign_with(private_key, private_key_type)
        }

        async fn load_signer(
            &self,
            private_key: &[u8],
            private_key_type: &PrivateKeyType,
        ) -> Result<Arc<dyn Signer>, SigningError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let subscription = self
                    .watcher
                    .subscribe(vec![LockTarget::device("device-1")])
                    .map_err(|e| SigningError::AccessError(e.to_string()))?;
                self.locks
                    .upsert_lock(&Lock::new("stolen", LockTarget::device("device-1")))
                    .await
                    .map_err(|e| SigningError::AccessError(e.to_string()))?;
                let _ = tokio::time::timeout(Duration::from_secs(5), subscription.next()).await;
            }
            SoftwareKeys.load_signer(private_key, private_key_type).await
        }
    }

    fn device() -> DeviceExtensions {
        DeviceExtensions {
            device_id: "device-1".to_string(),
            asset_tag: "C02XYZ".to_string(),
            credential_id: "cred-1".to_string(),
        }
    }

    async fn issued(test: &TestCluster, user: &str) -> (UserCerts, AuthContext) {
        let certs = test
            .server
            .generate_user_certs(UserCertsRequest::new(
                user,
                roles(3600, &["alice", "root"]),
                public_key().await,
            ))
            .await
            .unwrap();
        let ctx = context(&certs.tls, user);
        (certs, ctx)
    }

    fn context(tls_cert: &str, user: &str) -> AuthContext {
        AuthContext {
            identity: Identity {
                username: user.to_string(),
                ..Default::default()
            },
            tls_cert: tls_cert.to_string(),
        }
    }

    fn with_device(ssh: Option<&str>) -> AugmentOptions {
        AugmentOptions {
            ssh_authorized_key: ssh.map(|s| s.to_string()),
            device_extensions: Some(device()),
        }
    }

    #[tokio::test]
    async fn augmented_pair_keeps_expiry_and_identity() {
        let test = cluster("root.local").await;
        let (certs, ctx) = issued(&test, "alice").await;

        let out = test
            .server
            .augment_certificates(&ctx, with_device(Some(&certs.ssh)))
            .await
            .unwrap();

        let user_ca = test
            .server
            .get_cert_authority(&CertAuthID::new(CertAuthType::User, "root.local"), false)
            .await
            .unwrap();
        let old = Certificate::from_string(&certs.ssh).unwrap();
        let new_ssh = ssh::decode_trusted(
            out.ssh.as_deref().unwrap(),
            &user_ca.trusted_ssh_public_keys().unwrap(),
        )
        .unwrap();
        let new_tls = tls::decode_trusted(&out.tls, &user_ca.trusted_tls_certs()).unwrap();

        assert_eq!(new_ssh.cert.valid_before, old.valid_before);
        assert_eq!(new_ssh.identity.device_extensions, device());
        assert_eq!(new_tls.identity.device_extensions, device());
        assert!(new_ssh.identity.matches_pair(&new_tls.identity));
        assert_eq!(new_tls.identity.groups, vec!["dev".to_string()]);
    }

    #[tokio::test]
    async fn extensions_can_only_be_added_once() {
        let test = cluster("root.local").await;

        // x509 only
        let (_, ctx) = issued(&test, "alice").await;
        let out = test
            .server
            .augment_certificates(&ctx, with_device(None))
            .await
            .unwrap();
        assert!(out.ssh.is_none());
        let ctx = context(&out.tls, "alice");
        let err = test
            .server
            .augment_certificates(&ctx, with_device(None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "extensions already present");

        // SSH only carries the extensions
        let (certs, ctx) = issued(&test, "alice").await;
        let out = test
            .server
            .augment_certificates(&ctx, with_device(Some(&certs.ssh)))
            .await
            .unwrap();
        let err = test
            .server
            .augment_certificates(&ctx, with_device(out.ssh.as_deref()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "extensions already present");
    }

    #[tokio::test]
    async fn mismatched_pairs_are_rejected() {
        let test = cluster("root.local").await;
        let (alice, ctx) = issued(&test, "alice").await;
        let (bob, _) = issued(&test, "bob").await;

        let wrong_user = context(&alice.tls, "bob");
        let err = test
            .server
            .augment_certificates(&wrong_user, with_device(None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "x509 user mismatch");

        let err = test
            .server
            .augment_certificates(&ctx, with_device(Some(&bob.ssh)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "public key mismatch");
    }

    #[tokio::test]
    async fn incomplete_device_data_is_rejected() {
        let test = cluster("root.local").await;
        let (_, ctx) = issued(&test, "alice").await;

        let err = test
            .server
            .augment_certificates(&ctx, AugmentOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());

        let mut partial = device();
        partial.asset_tag.clear();
        let err = test
            .server
            .augment_certificates(
                &ctx,
                AugmentOptions {
                    ssh_authorized_key: None,
                    device_extensions: Some(partial),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn locked_devices_cannot_be_bound() {
        let test = cluster("root.local").await;
        let (certs, ctx) = issued(&test, "alice").await;

        let subscription = test
            .server
            .lock_watcher()
            .subscribe(vec![LockTarget::device("device-1")])
            .unwrap();
        test.server
            .upsert_lock(Lock::new("stolen", LockTarget::device("device-1")))
            .await
            .unwrap();
        // Wait until the watcher has seen the lock
        tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap()
            .unwrap();
        subscription.close();

        let err = test
            .server
            .augment_certificates(&ctx, with_device(Some(&certs.ssh)))
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(
            err.to_string(),
            "lock targeting device:\"device-1\" is in force"
        );
    }

    #[tokio::test]
    async fn locks_placed_while_signers_load_stop_the_signing() {
        let mut test = cluster("root.local").await;
        let (certs, ctx) = issued(&test, "alice").await;
        test.server.key_store = KeyStore::new(Arc::new(LockWhileLoading {
            locks: test.server.lock_store.clone(),
            watcher: test.server.lock_watcher().clone(),
            fired: AtomicBool::new(false),
        }));
        assert!(test
            .server
            .lock_watcher()
            .get_locks_in_force(&[LockTarget::device("device-1")])
            .is_empty());

        let err = test
            .server
            .augment_certificates(&ctx, with_device(Some(&certs.ssh)))
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(
            err.to_string(),
            "lock targeting device:\"device-1\" is in force"
        );
        assert!(test.audit.try_iter().all(|record| !matches!(
            record.event,
            AuditEvent::CertificatesAugmented(_)
        )));
    }
}
