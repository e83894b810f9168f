#[macro_use]
extern crate log;

pub mod cache;
pub mod credentials;
pub mod error;
pub mod key;
pub mod requester;

pub use cache::{CacheConfiguration, CredentialCache};
pub use credentials::ClientCredentials;
pub use error::RequestError;
pub use key::IdentityKey;
pub use requester::{AuthServerRequester, CertificateRequester};
