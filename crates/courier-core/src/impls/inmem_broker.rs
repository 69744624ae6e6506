//! InMemoryBroker - a broker link for tests and dry runs.
//!
//! # Behaviour
//! - `deliver()` queues a delivery; [`InMemorySource`] hands it out as a lease.
//! - Every settlement is recorded in order.
//! - Publishing to the broker's own queue feeds the message back in as a new
//!   delivery with a fresh tag, the way a real broker would.
//! - `close()` ends the subscription once queued deliveries are drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::domain::{Delivery, Disposition, Publication};
use crate::error::BrokerError;
use crate::ports::{DeliveryLease, DeliverySource, Publisher};

#[derive(Debug, Default)]
struct Journal {
    settled: Vec<(u64, Disposition)>,
    published: Vec<(String, Publication)>,
}

pub struct InMemoryBroker {
    queue: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    journal: Arc<Mutex<Journal>>,
    next_tag: AtomicU64,
    fail_publish: AtomicBool,
}

impl InMemoryBroker {
    /// A broker serving `queue`, plus the subscription reading from it.
    pub fn new(queue: impl Into<String>) -> (Arc<Self>, InMemorySource) {
        let (tx, rx) = mpsc::unbounded_channel();
        let journal = Arc::new(Mutex::new(Journal::default()));
        let broker = Arc::new(Self {
            queue: queue.into(),
            tx: Mutex::new(Some(tx)),
            journal: Arc::clone(&journal),
            next_tag: AtomicU64::new(1),
            fail_publish: AtomicBool::new(false),
        });
        (broker, InMemorySource { rx, journal })
    }

    /// Queue a delivery. Its tag is replaced with the next free one, which
    /// is returned.
    pub async fn deliver(&self, mut delivery: Delivery) -> Result<u64, BrokerError> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        delivery.tag = tag;
        let tx = self.tx.lock().await;
        let sender = tx.as_ref().ok_or_else(|| BrokerError::Publish {
            queue: self.queue.clone(),
            reason: "broker closed".to_string(),
        })?;
        sender.send(delivery).map_err(|_| BrokerError::Publish {
            queue: self.queue.clone(),
            reason: "subscription dropped".to_string(),
        })?;
        Ok(tag)
    }

    /// Stop accepting deliveries.
    pub async fn close(&self) {
        self.tx.lock().await.take();
    }

    /// Make every later `publish` call fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub async fn settlements(&self) -> Vec<(u64, Disposition)> {
        self.journal.lock().await.settled.clone()
    }

    pub async fn publications(&self) -> Vec<(String, Publication)> {
        self.journal.lock().await.published.clone()
    }

    /// Wait until at least `n` deliveries were settled, or `timeout` passed.
    pub async fn wait_for_settlements(&self, n: usize, timeout: Duration) -> Vec<(u64, Disposition)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.settlements().await;
            if settled.len() >= n || tokio::time::Instant::now() >= deadline {
                return settled;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, queue: &str, publication: Publication) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "publishing disabled".to_string(),
            });
        }
        self.journal
            .lock()
            .await
            .published
            .push((queue.to_string(), publication.clone()));

        if queue == self.queue {
            let delivery = Delivery {
                tag: 0,
                body: publication.body,
                headers: publication.headers,
                content_type: publication.content_type,
                content_encoding: publication.content_encoding,
            };
            self.deliver(delivery).await?;
        }
        Ok(())
    }
}

pub struct InMemorySource {
    rx: mpsc::UnboundedReceiver<Delivery>,
    journal: Arc<Mutex<Journal>>,
}

#[async_trait]
impl DeliverySource for InMemorySource {
    async fn next_delivery(&mut self) -> Option<Box<dyn DeliveryLease>> {
        let delivery = self.rx.recv().await?;
        Some(Box::new(InMemoryLease {
            delivery,
            journal: Arc::clone(&self.journal),
        }))
    }
}

struct InMemoryLease {
    delivery: Delivery,
    journal: Arc<Mutex<Journal>>,
}

impl InMemoryLease {
    async fn record(&self, disposition: Disposition) {
        self.journal
            .lock()
            .await
            .settled
            .push((self.delivery.tag, disposition));
    }
}

#[async_trait]
impl DeliveryLease for InMemoryLease {
    fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.record(Disposition::Ack).await;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let disposition = if requeue {
            Disposition::NackRequeue
        } else {
            Disposition::Reject
        };
        self.record(disposition).await;
        Ok(())
    }
}
