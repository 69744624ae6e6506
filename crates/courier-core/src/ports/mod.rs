//! Ports - the seams between the dispatch core and the outside world.
//!
//! Each trait here has an AMQP/HTTP implementation under `impls` and an
//! in-memory one for tests.

pub mod broker;
pub mod event_sink;

pub use self::broker::{DeliveryLease, DeliverySource, Publisher, settle};
pub use self::event_sink::{EventSink, ReportingError};
