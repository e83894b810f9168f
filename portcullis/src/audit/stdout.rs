use super::{AuditError, AuditEvent, AuditRecord, AuditSink, Severity};

use serde::Deserialize;

#[derive(Deserialize)]
pub struct Config {}

pub struct StdoutSink {}

impl StdoutSink {
    pub fn new(_config: Config) -> Self {
        Self {}
    }
}

impl AuditSink for StdoutSink {
    fn send_event(&self, record: &AuditRecord) -> Result<(), AuditError> {
        match &record.event {
            AuditEvent::CertAuthorityCreated(e) => {
                info!("Certificate authority created: [{}] for [{}]", e.ca_type, e.domain)
            }
            AuditEvent::CertAuthorityRotated(e) => info!(
                "Certificate authority [{}] for [{}] moved to phase [{}] in rotation [{}]",
                e.ca_type, e.domain, e.phase, e.rotation_id
            ),
            AuditEvent::CertAuthorityKeysAdded(e) => warn!(
                "Added [{}] keys to [{}] authority of [{}] as additional trusted keys",
                e.key_store, e.ca_type, e.domain
            ),
            AuditEvent::UserCertificateIssued(e) => info!(
                "User certificates issued for: [{}] Roles: [{}] Principals granted: [{}] Kubernetes cluster: [{}] Route: [{}] Expires: [{}]",
                e.user,
                e.roles.join(", "),
                e.principals.join(", "),
                e.kubernetes_cluster,
                e.route_to_cluster,
                e.expires,
            ),
            AuditEvent::HostCertificateIssued(e) => info!(
                "Host certificates issued for: [{}] Node name: [{}] Role: [{}]",
                e.host_id, e.node_name, e.role
            ),
            AuditEvent::CertificatesAugmented(e) => info!(
                "Certificates augmented for: [{}] Device: [{}]",
                e.user, e.device_id
            ),
            AuditEvent::LockCreated(e) => {
                info!("Lock [{}] created targeting [{}]: {}", e.name, e.target, e.message)
            }
            AuditEvent::LockDeleted(e) => info!("Lock [{}] deleted", e.name),
            AuditEvent::TokenCreated(e) => {
                info!("Provisioning token created for roles: [{}]", e.roles.join(", "))
            }
            AuditEvent::HostJoined(e) => info!("Host [{}] joined as [{}]", e.host_id, e.role),
            AuditEvent::InternalMessage(im) => match im.severity {
                Severity::Error => error!("{}", im.message),
                Severity::Warning => warn!("{}", im.message),
                Severity::Info => info!("{}", im.message),
            },
            AuditEvent::Heartbeat(_) => (),
        }
        Ok(())
    }
}
