//! Port implementations.
//!
//! - **amqp**: RabbitMQ via `lapin`
//! - **inmem_broker**: in-process broker for tests and dry runs
//! - **reporter**: provisioning events over HTTP

pub mod amqp;
pub mod inmem_broker;
pub mod reporter;

pub use amqp::{AmqpLink, AmqpPublisher, AmqpSubscription};
pub use inmem_broker::{InMemoryBroker, InMemorySource};
pub use reporter::HttpReporter;
