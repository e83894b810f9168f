//! Structured audit events. Operations hand events to an `AuditEmitter`,
//! which never blocks or fails the operation; a dedicated thread fans the
//! events out to the configured sinks.

mod stdout;
#[cfg(feature = "webhook")]
mod webhook;

use stdout::StdoutSink;

use crate::utils::{unix_seconds, Clock};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A heartbeat to keep external systems informed the authority is healthy
#[derive(Debug, Serialize)]
pub struct Heartbeat {
    pub identifier: String,
}

/// Issued when a certificate authority is created for the first time
#[derive(Debug, Serialize)]
pub struct CertAuthorityCreated {
    pub ca_type: String,
    pub domain: String,
}

/// Issued on every rotation phase change
#[derive(Debug, Serialize)]
pub struct CertAuthorityRotated {
    pub ca_type: String,
    pub domain: String,
    pub rotation_id: String,
    pub phase: String,
}

/// Issued when an instance adds its own keys to a CA as additional trusted
/// keys
#[derive(Debug, Serialize)]
pub struct CertAuthorityKeysAdded {
    pub ca_type: String,
    pub domain: String,
    pub key_store: String,
}

/// Issued when a user certificate pair is signed
#[derive(Debug, Serialize)]
pub struct UserCertificateIssued {
    pub user: String,
    pub roles: Vec<String>,
    pub principals: Vec<String>,
    pub kubernetes_cluster: String,
    pub route_to_cluster: String,
    pub expires: u64,
}

/// Issued when a host certificate pair is signed
#[derive(Debug, Serialize)]
pub struct HostCertificateIssued {
    pub host_id: String,
    pub node_name: String,
    pub role: String,
}

/// Issued when an existing certificate pair is augmented
#[derive(Debug, Serialize)]
pub struct CertificatesAugmented {
    pub user: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct LockCreated {
    pub name: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct LockDeleted {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct TokenCreated {
    pub roles: Vec<String>,
}

/// Issued when a host joins with a provisioning token
#[derive(Debug, Serialize)]
pub struct HostJoined {
    pub host_id: String,
    pub role: String,
}

/// Notable conditions that are not tied to a single request
#[derive(Debug, Serialize)]
pub struct InternalMessage {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub enum AuditEvent {
    CertAuthorityCreated(CertAuthorityCreated),
    CertAuthorityRotated(CertAuthorityRotated),
    CertAuthorityKeysAdded(CertAuthorityKeysAdded),
    UserCertificateIssued(UserCertificateIssued),
    HostCertificateIssued(HostCertificateIssued),
    CertificatesAugmented(CertificatesAugmented),
    LockCreated(LockCreated),
    LockDeleted(LockDeleted),
    TokenCreated(TokenCreated),
    HostJoined(HostJoined),
    InternalMessage(InternalMessage),
    Heartbeat(Heartbeat),
}

/// An event stamped with where and when it happened.
#[derive(Debug, Serialize)]
pub struct AuditRecord {
    pub cluster: String,
    pub time: u64,
    pub event: AuditEvent,
}

#[derive(Debug)]
pub enum AuditError {
    SerializationError(String),
    CommunicationError(String),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::SerializationError(e) => write!(f, "could not serialize audit event: {}", e),
            AuditError::CommunicationError(e) => write!(f, "could not deliver audit event: {}", e),
        }
    }
}

/// To implement a new sink, implement `send_event` and return success or
/// failure. Failures are logged and never reach the emitting operation.
pub trait AuditSink {
    fn send_event(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

#[derive(Default, Deserialize)]
pub struct AuditConfiguration {
    stdout: Option<stdout::Config>,
    #[cfg(feature = "webhook")]
    webhook: Option<webhook::Config>,
}

/// Hands events to the audit thread.
#[derive(Clone)]
pub struct AuditEmitter {
    sender: Sender<AuditRecord>,
    cluster: String,
    clock: Arc<dyn Clock>,
}

impl AuditEmitter {
    /// An emitter and the receiving end the audit thread consumes.
    pub fn channel(cluster: &str, clock: Arc<dyn Clock>) -> (Self, Receiver<AuditRecord>) {
        let (sender, receiver) = unbounded();
        (
            Self {
                sender,
                cluster: cluster.to_string(),
                clock,
            },
            receiver,
        )
    }

    /// Fire and forget. A failure to enqueue is logged.
    pub fn emit(&self, event: AuditEvent) {
        let record = AuditRecord {
            cluster: self.cluster.clone(),
            time: unix_seconds(self.clock.now()),
            event,
        };
        if let Err(e) = self.sender.send(record) {
            error!("Could not emit audit event {:?}: audit thread has gone away", e.0.event);
        }
    }
}

pub fn start_audit_thread(
    config: AuditConfiguration,
    receiver: Receiver<AuditRecord>,
    identifier: String,
    #[allow(unused_variables)] handle: tokio::runtime::Handle,
) {
    let mut sinks: Vec<Box<dyn AuditSink>> = vec![];
    if let Some(config) = config.stdout {
        info!("Configured audit sink: stdout");
        sinks.push(Box::new(StdoutSink::new(config)));
    }

    #[cfg(feature = "webhook")]
    if let Some(config) = config.webhook {
        match webhook::WebhookSink::new(config, handle) {
            Ok(sink) => {
                info!("Configured audit sink: webhook");
                sinks.push(Box::new(sink));
            }
            Err(e) => error!("Could not configure the webhook audit sink: {}", e),
        }
    }

    loop {
        let record = match receiver.recv_timeout(Duration::from_secs(300)) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => AuditRecord {
                cluster: String::new(),
                time: 0,
                event: AuditEvent::Heartbeat(Heartbeat {
                    identifier: identifier.clone(),
                }),
            },
            Err(RecvTimeoutError::Disconnected) => break,
        };

        for sink in &sinks {
            if let Err(e) = sink.send_event(&record) {
                error!("{}", e);
            }
        }
    }

    info!("Audit thread has gone away.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{from_unix_seconds, FakeClock};

    #[test]
    fn events_are_stamped() {
        let clock = FakeClock::new(from_unix_seconds(1_000));
        let (emitter, receiver) = AuditEmitter::channel("root.local", Arc::new(clock));
        emitter.emit(AuditEvent::LockDeleted(LockDeleted {
            name: "l1".to_string(),
        }));
        let record = receiver.try_recv().unwrap();
        assert_eq!(record.cluster, "root.local");
        assert_eq!(record.time, 1_000);
    }

    #[test]
    fn emitting_without_a_consumer_does_not_panic() {
        let (emitter, receiver) = AuditEmitter::channel("root.local", crate::utils::system_clock());
        drop(receiver);
        emitter.emit(AuditEvent::TokenCreated(TokenCreated {
            roles: vec!["Node".to_string()],
        }));
    }
}
