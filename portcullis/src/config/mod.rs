use crate::audit::AuditConfiguration;
use crate::auth::CertificateConfiguration;
use crate::authority::{MigrationConfiguration, RotationConfiguration};
use crate::backend::{Backend, BackendConfiguration};
use crate::error::AuthorityError;
use crate::keystore::{KeyStore, KeyStoreConfiguration};
use crate::locks::LockWatcherConfiguration;
use crate::types::ProvisionToken;
use crate::utils::Clock;

use clap::{Arg, Command};
use serde::Deserialize;

use std::sync::Arc;

#[derive(Deserialize)]
pub struct Configuration {
    pub cluster_name: String,
    #[serde(default)]
    pub data_dir: String,
    /// Identifies this instance. Keys only this instance can use are
    /// tagged with it.
    pub host_uuid: String,
    #[serde(default)]
    pub keystore: KeyStoreConfiguration,
    #[serde(default)]
    pub backend: BackendConfiguration,
    #[serde(default)]
    pub audit: AuditConfiguration,
    #[serde(default)]
    pub locks: LockWatcherConfiguration,
    #[serde(default)]
    pub certificates: CertificateConfiguration,
    #[serde(default)]
    pub rotation: RotationConfiguration,
    #[serde(default)]
    pub migrations: MigrationConfiguration,
    #[serde(default)]
    pub static_tokens: Vec<ProvisionToken>,
}

/// Everything the binary needs, with the configured backends opened.
pub struct PortcullisSettings {
    pub cluster_name: String,
    pub host_uuid: String,
    pub key_store: KeyStore,
    pub backend: Arc<dyn Backend>,
    pub audit: AuditConfiguration,
    pub locks: LockWatcherConfiguration,
    pub certificates: CertificateConfiguration,
    pub rotation: RotationConfiguration,
    pub migrations: MigrationConfiguration,
    pub static_tokens: Vec<ProvisionToken>,
}

pub enum ConfigurationError {
    FileError,
    ParsingError(String),
    InvalidSetting(String),
    KeyStoreError(AuthorityError),
    BackendError(AuthorityError),
    ValidateOnly,
}

impl std::error::Error for ConfigurationError {}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileError => write!(f, "Could not read configuration file"),
            Self::ParsingError(e) => write!(f, "Could not parse the configuration file: {}", e),
            Self::InvalidSetting(e) => write!(f, "Invalid configuration: {}", e),
            Self::KeyStoreError(e) => write!(f, "Could not configure the key store: {}", e),
            Self::BackendError(e) => write!(f, "Could not open the backend: {}", e),
            Self::ValidateOnly => write!(f, "Configuration was validated"),
        }
    }
}

impl std::fmt::Debug for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<ConfigurationError> for AuthorityError {
    fn from(e: ConfigurationError) -> Self {
        AuthorityError::bad_parameter(e.to_string())
    }
}

/// Parse and check a TOML configuration without touching any backend.
pub fn parse(contents: &str) -> Result<Configuration, ConfigurationError> {
    let mut config: Configuration =
        toml::from_str(contents).map_err(|e| ConfigurationError::ParsingError(e.to_string()))?;

    if config.cluster_name.is_empty() {
        return Err(ConfigurationError::InvalidSetting(
            "cluster_name must be set".to_string(),
        ));
    }
    if config.host_uuid.is_empty() {
        return Err(ConfigurationError::InvalidSetting(
            "host_uuid must be set".to_string(),
        ));
    }
    if config.certificates.default_ttl_seconds > config.certificates.max_ttl_seconds {
        return Err(ConfigurationError::InvalidSetting(
            "certificates.default_ttl_seconds exceeds certificates.max_ttl_seconds".to_string(),
        ));
    }
    for token in &config.static_tokens {
        token
            .check()
            .map_err(|e| ConfigurationError::InvalidSetting(e.to_string()))?;
    }
    if let Some(keyring) = config.keystore.keyring.as_mut() {
        if keyring.data_dir.is_empty() {
            keyring.data_dir = config.data_dir.clone();
        }
    }
    Ok(config)
}

impl Configuration {
    /// Open the configured key store and backend.
    pub async fn into_settings(
        self,
        clock: Arc<dyn Clock>,
    ) -> Result<PortcullisSettings, ConfigurationError> {
        let key_store = self
            .keystore
            .into_key_store(&self.host_uuid)
            .await
            .map_err(ConfigurationError::KeyStoreError)?;
        let backend = self
            .backend
            .open(clock)
            .map_err(ConfigurationError::BackendError)?;

        Ok(PortcullisSettings {
            cluster_name: self.cluster_name,
            host_uuid: self.host_uuid,
            key_store,
            backend,
            audit: self.audit,
            locks: self.locks,
            certificates: self.certificates,
            rotation: self.rotation,
            migrations: self.migrations,
            static_tokens: self.static_tokens,
        })
    }
}

pub async fn configure(clock: Arc<dyn Clock>) -> Result<PortcullisSettings, ConfigurationError> {
    let matches = Command::new("Portcullis")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Portcullis is the certificate authority of an access plane")
        .arg(
            Arg::new("config")
                .help("Path to Portcullis configuration toml file")
                .long("config")
                .default_value("/etc/portcullis/portcullis.toml")
                .takes_value(true),
        )
        .arg(
            Arg::new("validate")
                .help("Only validate the configuration and then quit. Useful for testing configuration changes.")
                .long("validate-config")
                .short('v')
                .takes_value(false),
        )
        .get_matches();

    let path = matches
        .value_of("config")
        .ok_or(ConfigurationError::FileError)?;
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            error!("Failed to read config at {}: {}", path, e);
            return Err(ConfigurationError::FileError);
        }
    };

    let config = parse(&contents)?;
    let settings = config.into_settings(clock).await?;

    if matches.is_present("validate") {
        return Err(ConfigurationError::ValidateOnly);
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LockingMode, SystemRole};
    use crate::utils::system_clock;

    const FULL: &str = r#"
cluster_name = "root.local"
data_dir = "/var/lib/portcullis"
host_uuid = "6c3b1b1e-auth-1"

[keystore.keyring]

[backend]
type = "memory"

[locks]
mode = "strict"

[certificates]
default_ttl_seconds = 3600
max_ttl_seconds = 7200

[rotation]
grace_period_seconds = 600

[migrations]
disabled = ["db-ca-from-host-ca"]

[[static_tokens]]
name = "bootstrap"
roles = ["node", "proxy"]
"#;

    #[test]
    fn full_configuration_parses() {
        let config = parse(FULL).unwrap();
        assert_eq!(config.cluster_name, "root.local");
        assert_eq!(
            config.keystore.keyring.as_ref().unwrap().data_dir,
            "/var/lib/portcullis"
        );
        assert!(config.keystore.software.is_none());
        assert_eq!(config.locks.mode, LockingMode::Strict);
        assert_eq!(config.certificates.max_ttl_seconds, 7200);
        assert_eq!(config.rotation.grace_period_seconds, 600);
        assert_eq!(config.rotation.check_interval_seconds, 60);
        assert_eq!(config.migrations.disabled, vec!["db-ca-from-host-ca"]);
        assert_eq!(
            config.static_tokens[0].roles,
            vec![SystemRole::Node, SystemRole::Proxy]
        );
    }

    #[test]
    fn minimal_configuration_uses_defaults() {
        let config = parse("cluster_name = \"root.local\"\nhost_uuid = \"auth-1\"\n").unwrap();
        assert!(config.keystore.software.is_some());
        assert_eq!(config.locks.mode, LockingMode::BestEffort);
        assert_eq!(config.certificates.default_ttl_seconds, 12 * 60 * 60);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            parse("cluster_name = \"\"\nhost_uuid = \"auth-1\"\n"),
            Err(ConfigurationError::InvalidSetting(_))
        ));
        assert!(matches!(
            parse("cluster_name = 5"),
            Err(ConfigurationError::ParsingError(_))
        ));
        let ttl = "cluster_name = \"a\"\nhost_uuid = \"b\"\n[certificates]\ndefault_ttl_seconds = 10\nmax_ttl_seconds = 5\n";
        assert!(matches!(parse(ttl), Err(ConfigurationError::InvalidSetting(_))));
    }

    #[tokio::test]
    async fn two_key_stores_cannot_be_configured() {
        let config = parse(
            "cluster_name = \"a\"\nhost_uuid = \"b\"\ndata_dir = \"/tmp\"\n[keystore.software]\n[keystore.keyring]\n",
        )
        .unwrap();
        let err = config.into_settings(system_clock()).await.err().unwrap();
        assert!(matches!(err, ConfigurationError::KeyStoreError(_)));
    }
}
