//! courier-core
//!
//! Building blocks for a queue-to-command worker: take deliveries from a
//! broker queue, run each one through a process or HTTP command, and settle
//! it with exactly one ack or nack, republishing failed ones for a bounded
//! number of retries.
//!
//! # Modules
//! - **domain**: deliveries, retry counter, retry decision, provisioning events
//! - **ports**: broker and event sink contracts
//! - **command**: the command contract and its process/HTTP strategies
//! - **runner**: one execution attempt, logged and reported
//! - **app**: the dispatcher
//! - **impls**: lapin, in-memory and HTTP reporter adapters
//! - **config**: INI settings

pub mod app;
pub mod codec;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod runner;

pub use app::{Dispatcher, MalformedRetryHeader};
pub use command::CommandStrategy;
pub use config::Settings;
pub use runner::Runner;
