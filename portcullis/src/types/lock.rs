use crate::backend;
use crate::error::{AuthorityError, AuthorityResult};
use crate::utils::{from_unix_seconds, unix_seconds};

use serde::{Deserialize, Serialize};

use std::fmt;
use std::time::SystemTime;

/// What a lock applies to. Every non-empty field narrows the lock: a
/// request matches when all of the lock's set fields match it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mfa_device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_request: String,
}

impl LockTarget {
    pub fn user<S: Into<String>>(user: S) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn role<S: Into<String>>(role: S) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    pub fn login<S: Into<String>>(login: S) -> Self {
        Self {
            login: login.into(),
            ..Default::default()
        }
    }

    pub fn node<S: Into<String>>(node: S) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    pub fn mfa_device<S: Into<String>>(mfa_device: S) -> Self {
        Self {
            mfa_device: mfa_device.into(),
            ..Default::default()
        }
    }

    pub fn device<S: Into<String>>(device: S) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn access_request<S: Into<String>>(access_request: S) -> Self {
        Self {
            access_request: access_request.into(),
            ..Default::default()
        }
    }

    /// The set fields as (name, value) pairs in a fixed order.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("user", self.user.as_str()),
            ("role", self.role.as_str()),
            ("login", self.login.as_str()),
            ("node", self.node.as_str()),
            ("mfa_device", self.mfa_device.as_str()),
            ("device", self.device.as_str()),
            ("access_request", self.access_request.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Whether a lock with this target applies to `other`. Every field set
    /// here must be equal in `other`.
    pub fn matches(&self, other: &LockTarget) -> bool {
        let other_fields = other.fields();
        !self.is_empty()
            && self
                .fields()
                .iter()
                .all(|field| other_fields.contains(field))
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .fields()
            .iter()
            .map(|(k, v)| format!("{}:{:?}", k, v))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub target: LockTarget,
    #[serde(default)]
    pub message: String,
    /// Unix seconds after which the lock no longer applies.
    #[serde(default)]
    pub expires: Option<u64>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub created_by: String,
}

impl Lock {
    pub fn new<S: Into<String>>(name: S, target: LockTarget) -> Self {
        Self {
            name: name.into(),
            target,
            message: String::new(),
            expires: None,
            created_at: 0,
            created_by: String::new(),
        }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_expiry(mut self, expires: SystemTime) -> Self {
        self.expires = Some(unix_seconds(expires));
        self
    }

    pub fn check(&self) -> AuthorityResult<()> {
        if self.name.is_empty() {
            return Err(AuthorityError::bad_parameter("lock name is missing"));
        }
        if self.name.contains('/') {
            return Err(AuthorityError::bad_parameter(format!(
                "lock name {} must not contain '/'",
                self.name
            )));
        }
        if self.target.is_empty() {
            return Err(AuthorityError::bad_parameter(format!(
                "lock {} has an empty target",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_in_force(&self, now: SystemTime) -> bool {
        match self.expires {
            Some(expires) => from_unix_seconds(expires) > now,
            None => true,
        }
    }

    pub fn backend_key(&self) -> String {
        lock_key(&self.name)
    }

    /// The error returned to anything this lock blocks.
    pub fn in_force_error(&self) -> AuthorityError {
        AuthorityError::access_denied(lock_in_force_message(self))
    }
}

pub fn lock_key(name: &str) -> String {
    backend::key(&["locks", name])
}

pub fn lock_in_force_message(lock: &Lock) -> String {
    let mut msg = format!("lock targeting {} is in force", lock.target);
    if !lock.message.is_empty() {
        msg.push_str(": ");
        msg.push_str(&lock.message);
    }
    msg
}

/// How to treat requests while the lock view may be out of date.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// Use whatever locks are known.
    BestEffort,
    /// Deny every request while the lock view is stale.
    Strict,
}

impl Default for LockingMode {
    fn default() -> Self {
        LockingMode::BestEffort
    }
}
