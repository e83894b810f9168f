//! Capability interfaces over the backend, one per concern. The auth server
//! holds a named reference to each so tests can swap any of them.

mod locks;
mod presence;
mod provisioner;
mod trust;

pub use locks::{LockService, LockStore};
pub use presence::{Presence, PresenceService};
pub use provisioner::{ProvisionService, Provisioner};
pub use trust::{Trust, TrustService};

use crate::backend::Item;
use crate::error::AuthorityResult;

use serde::de::DeserializeOwned;
use serde::Serialize;

fn to_item<T: Serialize>(key: String, resource: &T) -> AuthorityResult<Item> {
    Ok(Item::new(key, serde_json::to_vec(resource)?))
}

fn from_item<T: DeserializeOwned>(item: &Item) -> AuthorityResult<T> {
    Ok(serde_json::from_slice(&item.value)?)
}
