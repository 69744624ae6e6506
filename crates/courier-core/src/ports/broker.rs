//! Broker ports - what the dispatcher needs from a message broker.
//!
//! # Design
//! - A [`DeliverySource`] hands out leases, one per delivery.
//! - A [`DeliveryLease`] must be settled exactly once. `ack`/`nack` consume
//!   the boxed lease, so settling twice does not compile.
//! - A [`Publisher`] is shared by every handling unit; implementations must be
//!   safe to call concurrently.

use async_trait::async_trait;

use crate::domain::{Delivery, Disposition, Publication};
use crate::error::BrokerError;

#[async_trait]
pub trait DeliveryLease: Send {
    fn delivery(&self) -> &Delivery;

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// Settle `lease` with `disposition`.
pub async fn settle(
    lease: Box<dyn DeliveryLease>,
    disposition: Disposition,
) -> Result<(), BrokerError> {
    match disposition {
        Disposition::Ack => lease.ack().await,
        Disposition::NackRequeue => lease.nack(true).await,
        Disposition::Reject => lease.nack(false).await,
    }
}

#[async_trait]
pub trait DeliverySource: Send {
    /// Next delivery, or `None` once the subscription has ended.
    async fn next_delivery(&mut self) -> Option<Box<dyn DeliveryLease>>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `publication` to `queue` through the default exchange.
    async fn publish(&self, queue: &str, publication: Publication) -> Result<(), BrokerError>;
}
