use super::{AuditError, AuditRecord, AuditSink};

use serde::Deserialize;
use std::time::Duration;

use tokio::runtime::Handle;

/// The webhook specific configuration of the audit pipeline.
#[derive(Deserialize)]
pub struct Config {
    pub auth_header: Option<String>,
    pub url: String,
    pub timeout: u8,
}

/// Posts every audit record as JSON to a configured URL.
pub struct WebhookSink {
    /// A tokio runtime to send events on
    runtime: Handle,
    client: reqwest::Client,
    config: Config,
}

impl WebhookSink {
    pub fn new(config: Config, handle: Handle) -> Result<Self, AuditError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.into()))
            .build()
            .map_err(|e| AuditError::CommunicationError(e.to_string()))?;

        Ok(Self {
            runtime: handle,
            client,
            config,
        })
    }
}

impl AuditSink for WebhookSink {
    /// Sending does not block the other sinks, which also means delivery
    /// failures can only be logged from the spawned task.
    fn send_event(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let data = serde_json::to_string(record)
            .map_err(|e| AuditError::SerializationError(e.to_string()))?;

        let res = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .body(data);

        let res = if let Some(auth) = &self.config.auth_header {
            res.header("Authorization", auth)
        } else {
            res
        };

        self.runtime.spawn(async move {
            if let Err(e) = res.send().await {
                error!("Could not deliver audit event to webhook: {}", e);
            }
        });

        Ok(())
    }
}
