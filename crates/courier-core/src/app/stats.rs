//! Dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::Disposition;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCounts {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub republished: u64,
    pub publish_failures: u64,
}

/// Lock-free counters shared by all handling units.
#[derive(Debug, Default)]
pub struct DispatchStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    republished: AtomicU64,
    publish_failures: AtomicU64,
}

impl DispatchStats {
    pub fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.acked,
            Disposition::NackRequeue => &self.requeued,
            Disposition::Reject => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_republish(&self, ok: bool) {
        let counter = if ok {
            &self.republished
        } else {
            &self.publish_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            republished: self.republished.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
