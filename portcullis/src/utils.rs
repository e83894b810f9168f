use crate::error::{AuthorityError, AuthorityResult};

use ring::rand::{SecureRandom, SystemRandom};

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time. Everything that compares against "now"
/// takes one of these so tests can move time forward deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Seconds since the epoch. Times before the epoch collapse to zero.
pub fn unix_seconds(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    }
}

pub fn from_unix_seconds(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// A random serial for certificates. The top bit is cleared so the value
/// stays positive when encoded as an ASN.1 INTEGER.
pub fn random_serial() -> AuthorityResult<u64> {
    let mut buf = [0; 8];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| AuthorityError::Signing("could not generate a serial number".to_string()))?;
    Ok(u64::from_be_bytes(buf) & 0x7FFF_FFFF_FFFF_FFFF)
}

/// A random hex identifier used for key ids, rotation ids and lock names.
pub fn random_id() -> AuthorityResult<String> {
    let mut buf = [0; 16];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| AuthorityError::Signing("could not generate an identifier".to_string()))?;
    Ok(hex::encode(buf))
}

/// Serde helpers that store binary blobs as base64 strings inside JSON
/// documents.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(&encoded).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

/// Sort and deduplicate a list of strings so two lists can be compared
/// irrespective of order.
pub fn normalized(values: &[String]) -> Vec<String> {
    let mut values = values.to_vec();
    values.sort();
    values.dedup();
    values
}
