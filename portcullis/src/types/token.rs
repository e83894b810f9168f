use crate::backend;
use crate::error::{AuthorityError, AuthorityResult};
use crate::utils::from_unix_seconds;

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Roles cluster components join with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRole {
    Admin,
    Auth,
    Node,
    Proxy,
    Kube,
    Db,
    App,
}

impl SystemRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemRole::Admin => "Admin",
            SystemRole::Auth => "Auth",
            SystemRole::Node => "Node",
            SystemRole::Proxy => "Proxy",
            SystemRole::Kube => "Kube",
            SystemRole::Db => "Db",
            SystemRole::App => "App",
        }
    }
}

impl fmt::Display for SystemRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SystemRole {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(SystemRole::Admin),
            "auth" => Ok(SystemRole::Auth),
            "node" => Ok(SystemRole::Node),
            "proxy" => Ok(SystemRole::Proxy),
            "kube" => Ok(SystemRole::Kube),
            "db" => Ok(SystemRole::Db),
            "app" => Ok(SystemRole::App),
            _ => Err(AuthorityError::bad_parameter(format!(
                "unknown system role: {}",
                s
            ))),
        }
    }
}

/// A join token. Dynamic tokens live in the backend and are consumed on
/// use, static tokens come from configuration and are never consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionToken {
    pub name: String,
    pub roles: Vec<SystemRole>,
    #[serde(default)]
    pub expires: Option<u64>,
}

impl ProvisionToken {
    pub fn check(&self) -> AuthorityResult<()> {
        if self.name.is_empty() {
            return Err(AuthorityError::bad_parameter("token name is missing"));
        }
        if self.roles.is_empty() {
            return Err(AuthorityError::bad_parameter(
                "token must allow at least one role",
            ));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires, Some(e) if from_unix_seconds(e) <= now)
    }

    pub fn allows(&self, role: SystemRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn backend_key(&self) -> String {
        token_key(&self.name)
    }
}

pub fn token_key(name: &str) -> String {
    backend::key(&["tokens", name])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("node".parse::<SystemRole>().unwrap(), SystemRole::Node);
        assert_eq!("Proxy".parse::<SystemRole>().unwrap(), SystemRole::Proxy);
        assert!("wizard".parse::<SystemRole>().is_err());
    }

    #[test]
    fn expiry_is_inclusive() {
        let token = ProvisionToken {
            name: "join".to_string(),
            roles: vec![SystemRole::Node],
            expires: Some(50),
        };
        assert!(!token.is_expired(from_unix_seconds(49)));
        assert!(token.is_expired(from_unix_seconds(50)));
        assert!(token.allows(SystemRole::Node));
        assert!(!token.allows(SystemRole::Proxy));
    }
}
