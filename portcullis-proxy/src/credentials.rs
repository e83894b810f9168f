use crate::error::RequestError;

use x509_parser::pem::parse_x509_pem;

use std::time::Duration;

/// A client certificate and key a forwarder presents to a downstream
/// service on the user's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentials {
    pub cert_pem: String,
    pub private_key_pem: String,
    /// Authorities the downstream service's certificate must chain to.
    pub ca_pems: Vec<String>,
    /// Unix seconds.
    pub not_after: u64,
}

impl ClientCredentials {
    /// Build credentials from an issued certificate, reading its expiry.
    pub fn from_issued(
        cert_pem: String,
        private_key_pem: String,
        ca_pems: Vec<String>,
    ) -> Result<Self, RequestError> {
        let not_after = {
            let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
                .map_err(|e| RequestError::BadCredentials(e.to_string()))?;
            let cert = pem
                .parse_x509()
                .map_err(|e| RequestError::BadCredentials(e.to_string()))?;
            cert.validity().not_after.timestamp().max(0) as u64
        };
        Ok(Self {
            cert_pem,
            private_key_pem,
            ca_pems,
            not_after,
        })
    }

    /// Usable only with strictly more than `margin` of validity left.
    pub fn is_valid_for(&self, now: u64, margin: Duration) -> bool {
        self.not_after > now.saturating_add(margin.as_secs())
    }
}
