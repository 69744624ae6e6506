use thiserror::Error;

use crate::domain::RetryHeaderError;

/// Errors talking to the message broker.
///
/// `Connection` and `Topology` only occur at startup and abort the process.
/// The rest are per delivery.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed connecting to broker: {0}")]
    Connection(String),

    #[error("failed declaring topology: {0}")]
    Topology(String),

    #[error("failed to acknowledge delivery {tag}: {reason}")]
    Acknowledge { tag: u64, reason: String },

    #[error("failed to publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that stop the dispatcher as a whole.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("halting worker: could not parse retry header of delivery {tag}: {source}")]
    RetryHeader {
        tag: u64,
        #[source]
        source: RetryHeaderError,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
