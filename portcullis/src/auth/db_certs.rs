use super::{AuthServer, CLOCK_SKEW};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{tls, Identity};
use crate::types::CertAuthType;
use crate::utils::unix_seconds;

use std::time::Duration;

/// A database server asking for a certificate it can present to clients.
pub struct DatabaseCertRequest {
    /// DER encoded PKCS#10 request.
    pub csr: Vec<u8>,
    /// The first name is the subject, all of them are SANs.
    pub server_names: Vec<String>,
    pub ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct DatabaseCert {
    pub cert: String,
    /// Database authority certificates, for the server's client trust.
    pub ca_certs: Vec<String>,
}

impl AuthServer {
    pub async fn generate_database_cert(
        &self,
        req: DatabaseCertRequest,
    ) -> AuthorityResult<DatabaseCert> {
        let subject = req
            .server_names
            .first()
            .ok_or_else(|| AuthorityError::bad_parameter("at least one server name is required"))?;

        let now = self.now();
        let identity = Identity {
            username: subject.clone(),
            teleport_cluster: self.cluster_name.clone(),
            expires: unix_seconds(now + self.ttl(req.ttl)),
            ..Default::default()
        };

        let db_ca = self.local_authority(CertAuthType::Database).await?;
        let signer = self.tls_signer(&db_ca).await?;
        let cert = tls::issue_from_csr(
            &signer,
            &identity,
            &req.csr,
            &req.server_names,
            now - CLOCK_SKEW,
        )?;
        debug!("Issued database certificate for {:?}", req.server_names);

        Ok(DatabaseCert {
            cert,
            ca_certs: db_ca.trusted_tls_certs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster, csr};
    use super::*;
    use crate::types::CertAuthID;

    use x509_parser::pem::parse_x509_pem;

    #[tokio::test]
    async fn database_certs_name_every_server() {
        let test = cluster("root.local").await;
        let out = test
            .server
            .generate_database_cert(DatabaseCertRequest {
                csr: csr(),
                server_names: vec!["postgres.internal".to_string(), "10.1.2.3".to_string()],
                ttl: Duration::from_secs(3600),
            })
            .await
            .unwrap();

        let db_ca = test
            .server
            .get_cert_authority(&CertAuthID::new(CertAuthType::Database, "root.local"), false)
            .await
            .unwrap();
        assert_eq!(out.ca_certs, db_ca.trusted_tls_certs());
        let decoded = tls::decode_trusted(&out.cert, &out.ca_certs).unwrap();
        assert_eq!(decoded.identity.username, "postgres.internal");

        let (_, pem) = parse_x509_pem(out.cert.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let sans = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(sans.value.general_names.len(), 2);
    }

    #[tokio::test]
    async fn server_names_are_required() {
        let test = cluster("root.local").await;
        let err = test
            .server
            .generate_database_cert(DatabaseCertRequest {
                csr: csr(),
                server_names: vec![],
                ttl: Duration::ZERO,
            })
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
