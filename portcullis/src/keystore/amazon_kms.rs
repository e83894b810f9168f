//! Keys created and used through Amazon KMS. Any instance configured with
//! the same account and region can sign with them.

use super::{GeneratedKey, KeyBackend, Signer, SigningError};
use crate::error::{AuthorityError, AuthorityResult};
use crate::types::PrivateKeyType;

use async_trait::async_trait;
use aws_credential_types::provider::{future, ProvideCredentials};
use aws_credential_types::Credentials;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{KeySpec, KeyUsageType, SigningAlgorithmSpec};
use aws_sdk_kms::Client;
use aws_types::region::Region;
use serde::Deserialize;

use std::sync::Arc;

/// Defines the configuration of the AmazonKMS key store
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The AWS access key that can create and use KMS keys
    aws_access_key_id: String,
    /// The secret corresponding to the AWS access key
    aws_secret_access_key: String,
    /// The region to be used
    aws_region: String,
    /// The account the keys are created in. Keys from other accounts are
    /// never considered usable.
    aws_account: String,
}

impl ProvideCredentials for Config {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::ready(Ok(Credentials::new(
            self.aws_access_key_id.clone(),
            self.aws_secret_access_key.clone(),
            None,
            None,
            "PortcullisKeyStore",
        )))
    }
}

impl Config {
    pub async fn into_backend(self) -> AuthorityResult<Box<dyn KeyBackend>> {
        if self.aws_account.is_empty() || self.aws_region.is_empty() {
            return Err(AuthorityError::bad_parameter(
                "amazonkms requires an account and region",
            ));
        }
        let aws_config = aws_config::from_env()
            .region(Region::new(self.aws_region.clone()))
            .credentials_provider(self.clone())
            .load()
            .await;

        Ok(Box::new(AmazonKms {
            client: Client::new(&aws_config),
            account: self.aws_account,
            region: self.aws_region,
        }))
    }
}

pub struct AmazonKms {
    client: Client,
    account: String,
    region: String,
}

impl AmazonKms {
    fn owned_arn<'a>(&self, private_key_type: &'a PrivateKeyType) -> Option<&'a str> {
        match private_key_type {
            PrivateKeyType::AwsKms {
                account,
                region,
                arn,
            } if *account == self.account && *region == self.region => Some(arn.as_str()),
            _ => None,
        }
    }

    async fn signer_for(&self, arn: &str) -> Result<KmsSigner, SigningError> {
        let public_key = self
            .client
            .get_public_key()
            .key_id(arn)
            .send()
            .await
            .map_err(|e| SigningError::AccessError(e.to_string()))?
            .public_key()
            .map(|k| k.as_ref().to_vec())
            .ok_or_else(|| SigningError::AccessError(format!("KMS returned no public key for {}", arn)))?;

        Ok(KmsSigner {
            client: self.client.clone(),
            arn: arn.to_string(),
            public_key_der: public_key,
        })
    }
}

struct KmsSigner {
    client: Client,
    arn: String,
    public_key_der: Vec<u8>,
}

#[async_trait]
impl Signer for KmsSigner {
    fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        let result = self
            .client
            .sign()
            .key_id(&self.arn)
            .signing_algorithm(SigningAlgorithmSpec::EcdsaSha256)
            .message(Blob::new(data))
            .send()
            .await
            .map_err(|e| SigningError::AccessError(e.to_string()))?;

        result
            .signature()
            .map(|s| s.as_ref().to_vec())
            .ok_or(SigningError::SigningFailure)
    }

    fn sign_blocking(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        // Requires the multi-threaded runtime
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.sign(data)))
    }
}

#[async_trait]
impl KeyBackend for AmazonKms {
    fn name(&self) -> &'static str {
        "amazon-kms"
    }

    async fn generate_key(&self) -> Result<GeneratedKey, SigningError> {
        let created = self
            .client
            .create_key()
            .key_spec(KeySpec::EccNistP256)
            .key_usage(KeyUsageType::SignVerify)
            .description("portcullis certificate authority key")
            .send()
            .await
            .map_err(|e| SigningError::AccessError(e.to_string()))?;

        let arn = created
            .key_metadata()
            .and_then(|m| m.arn())
            .ok_or_else(|| SigningError::AccessError("KMS did not return a key ARN".to_string()))?
            .to_string();
        info!("Created KMS key [{}]", arn);

        let signer = self.signer_for(&arn).await?;
        Ok(GeneratedKey {
            signer: Arc::new(signer),
            private_key: vec![],
            private_key_type: PrivateKeyType::AwsKms {
                account: self.account.clone(),
                region: self.region.clone(),
                arn,
            },
        })
    }

    fn can_sign_with(&self, _private_key: &[u8], private_key_type: &PrivateKeyType) -> bool {
        self.owned_arn(private_key_type).is_some()
    }

    async fn load_signer(
        &self,
        _private_key: &[u8],
        private_key_type: &PrivateKeyType,
    ) -> Result<Arc<dyn Signer>, SigningError> {
        let arn = self.owned_arn(private_key_type).ok_or_else(|| {
            SigningError::AccessError(format!(
                "key is not held in account {} region {}",
                self.account, self.region
            ))
        })?;
        Ok(Arc::new(self.signer_for(arn).await?))
    }
}
