//! EventSink port - best-effort telemetry about attempts.

use async_trait::async_trait;

use crate::domain::ProvisioningEvent;

#[derive(Debug, thiserror::Error)]
pub enum ReportingError {
    #[error("reporting request failed: {0}")]
    Request(String),

    #[error("reporting endpoint answered {status}")]
    Status { status: u16 },
}

/// EventSink receives one event per execution attempt.
///
/// Errors are for logging only. They never change how a delivery is settled.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ProvisioningEvent) -> Result<(), ReportingError>;
}
