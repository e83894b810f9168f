use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Which kind of private key a user must hold to be issued certificates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateKeyPolicy {
    None,
    HardwareKey,
    HardwareKeyTouch,
}

impl PrivateKeyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivateKeyPolicy::None => "none",
            PrivateKeyPolicy::HardwareKey => "hardware_key",
            PrivateKeyPolicy::HardwareKeyTouch => "hardware_key_touch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" | "" => Some(PrivateKeyPolicy::None),
            "hardware_key" => Some(PrivateKeyPolicy::HardwareKey),
            "hardware_key_touch" => Some(PrivateKeyPolicy::HardwareKeyTouch),
            _ => None,
        }
    }
}

impl Default for PrivateKeyPolicy {
    fn default() -> Self {
        PrivateKeyPolicy::None
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleOptions {
    /// The longest a certificate issued under this role may live.
    pub max_session_ttl_seconds: u64,
    #[serde(default)]
    pub pin_source_ip: bool,
    #[serde(default)]
    pub private_key_policy: PrivateKeyPolicy,
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self {
            max_session_ttl_seconds: 12 * 60 * 60,
            pin_source_ip: false,
            private_key_policy: PrivateKeyPolicy::None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleConditions {
    #[serde(default)]
    pub logins: Vec<String>,
    #[serde(default)]
    pub kubernetes_users: Vec<String>,
    #[serde(default)]
    pub kubernetes_groups: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub options: RoleOptions,
    #[serde(default)]
    pub allow: RoleConditions,
}

impl Role {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            options: RoleOptions::default(),
            allow: RoleConditions::default(),
        }
    }
}

/// The resolved permissions of the caller, as seen by the issuance engine.
/// Forwarders hand in whatever checker they resolved the caller to.
pub trait AccessChecker: Send + Sync {
    fn role_names(&self) -> Vec<String>;

    /// Clamp a requested TTL to what every role allows.
    fn adjust_session_ttl(&self, ttl: Duration) -> Duration;

    fn logins(&self) -> Vec<String>;

    fn kubernetes_users(&self) -> Vec<String>;

    fn kubernetes_groups(&self) -> Vec<String>;

    fn pin_source_ip(&self) -> bool;

    fn private_key_policy(&self) -> PrivateKeyPolicy;
}

/// The union of a user's roles. The strictest option wins and allowed
/// values are merged.
#[derive(Clone, Debug, Default)]
pub struct RoleSet {
    roles: Vec<Role>,
}

impl RoleSet {
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    fn collect<F>(&self, values: F) -> Vec<String>
    where
        F: Fn(&Role) -> &Vec<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for role in &self.roles {
            for v in values(role) {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        out
    }
}

impl AccessChecker for RoleSet {
    fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    fn adjust_session_ttl(&self, ttl: Duration) -> Duration {
        self.roles
            .iter()
            .map(|r| Duration::from_secs(r.options.max_session_ttl_seconds))
            .fold(ttl, |ttl, max| ttl.min(max))
    }

    fn logins(&self) -> Vec<String> {
        self.collect(|r| &r.allow.logins)
    }

    fn kubernetes_users(&self) -> Vec<String> {
        self.collect(|r| &r.allow.kubernetes_users)
    }

    fn kubernetes_groups(&self) -> Vec<String> {
        self.collect(|r| &r.allow.kubernetes_groups)
    }

    fn pin_source_ip(&self) -> bool {
        self.roles.iter().any(|r| r.options.pin_source_ip)
    }

    fn private_key_policy(&self) -> PrivateKeyPolicy {
        self.roles
            .iter()
            .map(|r| r.options.private_key_policy)
            .max()
            .unwrap_or_default()
    }
}
