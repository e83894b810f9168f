//! ES256 tokens signed by the JWT authority, handed to applications behind
//! the proxy so they can identify the user.

use super::AuthServer;
use crate::error::{AuthorityError, AuthorityResult};
use crate::keystore::raw_public_key;
use crate::types::CertAuthType;
use crate::utils::unix_seconds;

use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_FIXED};
use serde::{Deserialize, Serialize};

use std::time::Duration;

const HEADER: &str = r#"{"alg":"ES256","typ":"JWT"}"#;

pub struct JwtRequest {
    pub username: String,
    pub roles: Vec<String>,
    /// The application the token is for.
    pub uri: String,
    pub ttl: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub username: String,
    pub roles: Vec<String>,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
}

fn encode(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

fn decode(part: &str) -> AuthorityResult<Vec<u8>> {
    base64::decode_config(part, base64::URL_SAFE_NO_PAD)
        .map_err(|_| AuthorityError::bad_parameter("malformed JWT"))
}

impl AuthServer {
    pub async fn generate_jwt(&self, req: JwtRequest) -> AuthorityResult<String> {
        if req.username.is_empty() || req.uri.is_empty() {
            return Err(AuthorityError::bad_parameter(
                "a JWT needs a username and an audience",
            ));
        }
        let now = unix_seconds(self.now());
        let claims = JwtClaims {
            iss: self.cluster_name.clone(),
            sub: req.username.clone(),
            aud: vec![req.uri],
            username: req.username,
            roles: req.roles,
            iat: now,
            nbf: now,
            exp: now + self.ttl(req.ttl).as_secs(),
        };

        let ca = self.local_authority(CertAuthType::Jwt).await?;
        let signer = self.key_store.get_jwt_signer(&ca).await?;
        let signing_input = format!(
            "{}.{}",
            encode(HEADER.as_bytes()),
            encode(&serde_json::to_vec(&claims)?)
        );
        let signature = signer.sign(signing_input.as_bytes()).await?;
        Ok(format!("{}.{}", signing_input, encode(&signature)))
    }

    /// Verify a token was signed by a trusted JWT key of this cluster, is
    /// currently valid and was issued for `uri`.
    pub async fn verify_jwt(&self, token: &str, uri: &str) -> AuthorityResult<JwtClaims> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthorityError::bad_parameter("malformed JWT"));
        }
        let header: serde_json::Value = serde_json::from_slice(&decode(parts[0])?)?;
        if header.get("alg").and_then(|a| a.as_str()) != Some("ES256") {
            return Err(AuthorityError::access_denied("unsupported JWT algorithm"));
        }
        let signing_input = &token[..parts[0].len() + 1 + parts[1].len()];
        let signature = decode(parts[2])?;

        let ca = self.local_authority(CertAuthType::Jwt).await?;
        let trusted = ca.trusted_keys();
        let verified = trusted.jwt.iter().any(|key| match raw_public_key(&key.public_key) {
            Ok(raw) => UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, raw)
                .verify(signing_input.as_bytes(), &signature)
                .is_ok(),
            Err(e) => {
                warn!("Skipping malformed JWT key in {}: {}", ca.id, e);
                false
            }
        });
        if !verified {
            return Err(AuthorityError::access_denied(
                "JWT is not signed by a trusted key",
            ));
        }

        let claims: JwtClaims = serde_json::from_slice(&decode(parts[1])?)?;
        let now = unix_seconds(self.now());
        if claims.exp <= now || claims.nbf > now {
            return Err(AuthorityError::access_denied("JWT is not valid at this time"));
        }
        if claims.iss != self.cluster_name || !claims.aud.iter().any(|a| a == uri) {
            return Err(AuthorityError::access_denied("JWT was issued for another audience"));
        }
        Ok(claims)
    }
}
