//! HttpReporter - posts provisioning events to a JSON-RPC endpoint.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ProvisioningEvent;
use crate::ports::{EventSink, ReportingError};

/// Sends each event as one `POST` with a JSON body.
///
/// Certificate verification is off: reporting endpoints are usually internal
/// hosts with self-signed certificates.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    client: reqwest::Client,
    address: String,
}

impl HttpReporter {
    pub fn new(address: impl Into<String>) -> Result<Self, ReportingError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReportingError::Request(e.to_string()))?;
        Ok(Self {
            client,
            address: address.into(),
        })
    }
}

#[async_trait]
impl EventSink for HttpReporter {
    async fn emit(&self, event: ProvisioningEvent) -> Result<(), ReportingError> {
        let resp = self
            .client
            .post(&self.address)
            .json(&event)
            .send()
            .await
            .map_err(|e| ReportingError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ReportingError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
