use crate::cache::CredentialCache;
use crate::credentials::ClientCredentials;
use crate::error::RequestError;
use crate::key::IdentityKey;

use async_trait::async_trait;
use portcullis::auth::{AuthServer, KubeCsrRequest};
use portcullis::types::AccessChecker;
use portcullis::utils::{unix_seconds, Clock};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;

/// Obtains fresh client credentials from the auth server.
#[async_trait]
pub trait CertificateRequester: Send + Sync {
    async fn request(
        &self,
        key: &IdentityKey,
        checker: Arc<dyn AccessChecker>,
    ) -> Result<ClientCredentials, RequestError>;
}

/// Requests credentials from an auth server running in the same process.
/// A new P-256 key is generated for every request and never leaves the
/// proxy.
pub struct AuthServerRequester {
    server: Arc<AuthServer>,
    clock: Arc<dyn Clock>,
}

impl AuthServerRequester {
    pub fn new(server: Arc<AuthServer>, clock: Arc<dyn Clock>) -> Self {
        Self { server, clock }
    }
}

fn new_csr(username: &str) -> Result<(Vec<u8>, String), RequestError> {
    let mut params = CertificateParams::new(vec![]);
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, username);
    params.distinguished_name = distinguished_name;
    params.key_pair = Some(KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?);

    let request = Certificate::from_params(params)?;
    Ok((
        request.serialize_request_der()?,
        request.serialize_private_key_pem(),
    ))
}

#[async_trait]
impl CertificateRequester for AuthServerRequester {
    async fn request(
        &self,
        key: &IdentityKey,
        checker: Arc<dyn AccessChecker>,
    ) -> Result<ClientCredentials, RequestError> {
        let now = unix_seconds(self.clock.now());
        if key.expires <= now {
            return Err(RequestError::BadCredentials(format!(
                "certificate of {} has expired",
                key.username
            )));
        }
        let (csr, private_key_pem) = new_csr(&key.username)?;

        let response = self
            .server
            .process_kube_csr(KubeCsrRequest {
                csr,
                user: key.username.clone(),
                checker,
                kubernetes_cluster: key.kubernetes_cluster.clone(),
                route_to_cluster: key.route_to_cluster.clone(),
                active_requests: key.active_requests.clone(),
                ttl: Duration::from_secs(key.expires - now),
            })
            .await?;

        debug!(
            "Received credentials for [{}] valid until {}",
            key.username, response.expires
        );
        ClientCredentials::from_issued(response.cert, private_key_pem, response.ca_certs)
    }
}

impl CredentialCache {
    /// Cached credentials for `key`, requested through `requester` when
    /// none can be reused.
    pub async fn get_or_request_from(
        &self,
        requester: &dyn CertificateRequester,
        key: &IdentityKey,
        checker: Arc<dyn AccessChecker>,
        cancel: &CancellationToken,
    ) -> Result<ClientCredentials, RequestError> {
        self.get_or_request(key, cancel, || requester.request(key, checker))
            .await
    }
}
