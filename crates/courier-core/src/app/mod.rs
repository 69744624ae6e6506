//! Application layer: wires ports, domain and commands into the consume loop.

pub mod dispatcher;
pub mod stats;

pub use dispatcher::{Dispatcher, DispatcherBuilder, MalformedRetryHeader};
pub use stats::{DispatchCounts, DispatchStats};
