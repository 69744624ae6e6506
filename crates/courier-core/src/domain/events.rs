//! Events - out-of-band telemetry about execution attempts.
//!
//! A [`ProvisioningEvent`] is a JSON-RPC 2.0 request envelope describing one
//! attempt. It is built from the attempt's outcome and the delivery body.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::outcome::ExecutionOutcome;

pub const PROVISIONING_METHOD: &str = "Event::createProvisioningEvent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub jsonrpc: String,
    pub method: String,
    pub id: i32,
    pub params: ProvisioningParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningParams {
    pub data: ProvisioningData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningData {
    pub is_error: bool,
    /// Captured output. On failure the error detail comes first.
    pub out: String,
    /// Delivery body, base64 (standard alphabet, padded).
    pub message: String,
}

impl ProvisioningEvent {
    /// Build an event with a random non-negative 31-bit id.
    pub fn from_outcome(outcome: &ExecutionOutcome, body: &[u8]) -> Self {
        Self::with_id(rand::random::<i32>() & i32::MAX, outcome, body)
    }

    pub fn with_id(id: i32, outcome: &ExecutionOutcome, body: &[u8]) -> Self {
        let out = match &outcome.error {
            None => outcome.output_lossy(),
            Some(err) if outcome.output.is_empty() => err.clone(),
            Some(err) => format!("{err}\n{}", outcome.output_lossy()),
        };
        Self {
            jsonrpc: "2.0".to_string(),
            method: PROVISIONING_METHOD.to_string(),
            id,
            params: ProvisioningParams {
                data: ProvisioningData {
                    is_error: !outcome.success,
                    out,
                    message: STANDARD.encode(body),
                },
            },
        }
    }
}
