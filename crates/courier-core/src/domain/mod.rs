//! Domain model (deliveries, retry counter, outcomes, decisions).
//!
//! Nothing here performs I/O. Broker adapters convert to and from these types.

pub mod decision;
pub mod delivery;
pub mod events;
pub mod outcome;
pub mod retry;

pub use decision::{Disposition, RetryDecider, Transition};
pub use delivery::{Delivery, HeaderValue, Headers, Publication};
pub use events::ProvisioningEvent;
pub use outcome::ExecutionOutcome;
pub use retry::{RETRY_COUNT_HEADER, RetryCount, RetryHeaderError};
