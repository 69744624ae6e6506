//! Decision model: what happens to a delivery after its attempt.
//!
//! [`RetryDecider`] is a pure function of (success, retry count). It never
//! touches the broker; the dispatcher turns its [`Transition`] into calls.

use super::retry::RetryCount;

/// Terminal disposition of a delivery. Exactly one per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Positive acknowledgment.
    Ack,
    /// Negative acknowledgment, handed back to the broker for redelivery.
    NackRequeue,
    /// Negative acknowledgment without requeue. Goes to the dead-letter
    /// exchange if one is bound to the queue.
    Reject,
}

/// State reached by a runnable delivery once its attempt finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Succeeded,

    /// Republish with the counter moved from `from` to `to`, then ack.
    FailedRetryable { from: RetryCount, to: RetryCount },

    /// Retries used up.
    FailedExhausted { count: RetryCount },

    /// Failure with dead-letter mode off: no retry is ever attempted.
    Failed,
}

impl Transition {
    /// Disposition of the original delivery.
    ///
    /// A retryable failure acks the original: the republished copy is the
    /// retry, not a broker-level requeue.
    pub fn disposition(self) -> Disposition {
        match self {
            Transition::Succeeded | Transition::FailedRetryable { .. } => Disposition::Ack,
            Transition::FailedExhausted { .. } | Transition::Failed => Disposition::Reject,
        }
    }
}

/// Retry policy for the dead-letter path.
///
/// `None` for `max_retries` means dead-letter mode is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecider {
    max_retries: Option<u32>,
}

impl RetryDecider {
    pub fn dead_letter(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }

    pub fn disabled() -> Self {
        Self { max_retries: None }
    }

    pub fn is_dead_letter(&self) -> bool {
        self.max_retries.is_some()
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn decide(&self, success: bool, count: RetryCount) -> Transition {
        if success {
            return Transition::Succeeded;
        }
        match self.max_retries {
            None => Transition::Failed,
            Some(max) if count.get() >= max => Transition::FailedExhausted { count },
            Some(_) => Transition::FailedRetryable {
                from: count,
                to: count.next(),
            },
        }
    }
}
