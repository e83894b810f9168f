use super::{AuthServer, HostCerts, HostCertsRequest};
use crate::audit::{AuditEvent, HostJoined, TokenCreated};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::{ProvisionToken, SystemRole};
use crate::utils::{random_id, unix_seconds};

use std::time::Duration;

pub struct RegisterRequest {
    pub token: String,
    pub host_id: String,
    pub node_name: String,
    pub role: SystemRole,
    pub public_key: String,
    pub additional_principals: Vec<String>,
    pub dns_names: Vec<String>,
}

impl AuthServer {
    /// Create a dynamic join token for `roles` and return its name.
    pub async fn create_token(&self, roles: Vec<SystemRole>, ttl: Duration) -> AuthorityResult<String> {
        let token = ProvisionToken {
            name: random_id()?,
            roles,
            expires: Some(unix_seconds(self.now() + ttl)),
        };
        self.provisioner.upsert_token(&token).await?;
        self.audit.emit(AuditEvent::TokenCreated(TokenCreated {
            roles: token.roles.iter().map(|r| r.to_string()).collect(),
        }));
        Ok(token.name)
    }

    /// Static tokens shadow dynamic tokens of the same name.
    async fn find_token(&self, name: &str) -> AuthorityResult<(ProvisionToken, bool)> {
        if let Some(token) = self.static_tokens.iter().find(|t| t.name == name) {
            return Ok((token.clone(), true));
        }
        let token = self.provisioner.get_token(name).await.map_err(|e| {
            if e.is_not_found() {
                AuthorityError::access_denied("invalid provisioning token")
            } else {
                e
            }
        })?;
        Ok((token, false))
    }

    /// Exchange a join token for host certificates.
    pub async fn register_using_token(&self, req: RegisterRequest) -> AuthorityResult<HostCerts> {
        let (token, is_static) = self.find_token(&req.token).await?;
        if token.is_expired(self.now()) {
            return Err(AuthorityError::access_denied("provisioning token has expired"));
        }
        if !token.allows(req.role) {
            warn!(
                "Host [{}] tried to join as {} with a token that does not allow it",
                req.host_id, req.role
            );
            return Err(AuthorityError::access_denied(format!(
                "provisioning token does not allow the {} role",
                req.role
            )));
        }

        let certs = self
            .generate_host_certs(HostCertsRequest {
                host_id: req.host_id.clone(),
                node_name: req.node_name,
                role: req.role,
                public_key: req.public_key,
                additional_principals: req.additional_principals,
                dns_names: req.dns_names,
                ttl: Duration::ZERO,
            })
            .await?;

        if !is_static {
            match self.provisioner.delete_token(&token.name).await {
                // Another host raced us to the same token, it is consumed either way
                Err(e) if e.is_not_found() => (),
                other => other?,
            }
        }

        info!("Host [{}] joined the cluster as {}", req.host_id, req.role);
        self.audit.emit(AuditEvent::HostJoined(HostJoined {
            host_id: req.host_id,
            role: req.role.to_string(),
        }));
        Ok(certs)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster, public_key};
    use super::*;

    async fn register(token: &str, role: SystemRole) -> RegisterRequest {
        RegisterRequest {
            token: token.to_string(),
            host_id: "node-uuid".to_string(),
            node_name: "node-1".to_string(),
            role,
            public_key: public_key().await,
            additional_principals: vec![],
            dns_names: vec![],
        }
    }

    #[tokio::test]
    async fn dynamic_tokens_are_single_use() {
        let test = cluster("root.local").await;
        let token = test
            .server
            .create_token(vec![SystemRole::Node], Duration::from_secs(600))
            .await
            .unwrap();

        test.server
            .register_using_token(register(&token, SystemRole::Node).await)
            .await
            .unwrap();
        let err = test
            .server
            .register_using_token(register(&token, SystemRole::Node).await)
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn tokens_only_allow_their_roles() {
        let test = cluster("root.local").await;
        let token = test
            .server
            .create_token(vec![SystemRole::Node], Duration::from_secs(600))
            .await
            .unwrap();
        let err = test
            .server
            .register_using_token(register(&token, SystemRole::Proxy).await)
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let test = cluster("root.local").await;
        let token = test
            .server
            .create_token(vec![SystemRole::Node], Duration::ZERO)
            .await
            .unwrap();
        let err = test
            .server
            .register_using_token(register(&token, SystemRole::Node).await)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "provisioning token has expired");
    }
}
