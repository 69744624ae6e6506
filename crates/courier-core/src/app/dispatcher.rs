//! Dispatcher - turns deliveries into attempts and attempts into dispositions.
//!
//! # Flow per delivery
//! 1. optional zlib decompression (failure: nack with requeue, nothing runs)
//! 2. retry count from headers (dead-letter mode only)
//! 3. `CommandFactory::create` then `Runner::run`
//! 4. `RetryDecider::decide`, republish on a retryable failure
//! 5. exactly one ack/nack on the lease
//!
//! Every delivery gets its own tokio task. There is no limit here: the
//! broker's prefetch count bounds how many leases can be outstanding.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};
use ulid::Ulid;

use super::stats::{DispatchCounts, DispatchStats};
use crate::codec;
use crate::command::CommandFactory;
use crate::domain::{Delivery, Disposition, Publication, RetryCount, RetryDecider, Transition};
use crate::error::DispatchError;
use crate::ports::{self, DeliveryLease, DeliverySource, Publisher};
use crate::runner::Runner;

/// What to do with a retry header that is present but not a number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRetryHeader {
    /// Requeue the delivery and stop the whole worker.
    #[default]
    Halt,
    /// Log it and carry on as if the counter were zero.
    TreatAsZero,
}

struct Shared {
    queue: String,
    compression: bool,
    on_malformed: MalformedRetryHeader,
    decider: RetryDecider,
    publisher: Option<Arc<dyn Publisher>>,
    factory: Arc<dyn CommandFactory>,
    runner: Runner,
    stats: DispatchStats,
}

/// Consumes a [`DeliverySource`] until it ends, shutdown is requested, or a
/// handling unit reports a fatal error.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

pub struct DispatcherBuilder {
    queue: String,
    factory: Arc<dyn CommandFactory>,
    runner: Runner,
    compression: bool,
    on_malformed: MalformedRetryHeader,
    dead_letter: Option<(u32, Arc<dyn Publisher>)>,
}

impl DispatcherBuilder {
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Retry failed deliveries by republishing to the work queue, at most
    /// `max_retries` times.
    pub fn dead_letter(mut self, max_retries: u32, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letter = Some((max_retries, publisher));
        self
    }

    pub fn on_malformed_retry_header(mut self, policy: MalformedRetryHeader) -> Self {
        self.on_malformed = policy;
        self
    }

    pub fn build(self) -> Dispatcher {
        let (decider, publisher) = match self.dead_letter {
            Some((max, publisher)) => (RetryDecider::dead_letter(max), Some(publisher)),
            None => (RetryDecider::disabled(), None),
        };
        Dispatcher {
            shared: Arc::new(Shared {
                queue: self.queue,
                compression: self.compression,
                on_malformed: self.on_malformed,
                decider,
                publisher,
                factory: self.factory,
                runner: self.runner,
                stats: DispatchStats::default(),
            }),
        }
    }
}

impl Dispatcher {
    pub fn builder(
        queue: impl Into<String>,
        factory: Arc<dyn CommandFactory>,
        runner: Runner,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            queue: queue.into(),
            factory,
            runner,
            compression: false,
            on_malformed: MalformedRetryHeader::default(),
            dead_letter: None,
        }
    }

    pub fn stats(&self) -> DispatchCounts {
        self.shared.stats.snapshot()
    }

    /// Run until `source` ends.
    pub async fn run<S: DeliverySource>(&self, source: S) -> Result<(), DispatchError> {
        let (_keep, shutdown) = watch::channel(false);
        self.run_until(source, shutdown).await
    }

    /// Run until `source` ends or `shutdown` turns true. In-flight units are
    /// always allowed to finish before this returns.
    pub async fn run_until<S: DeliverySource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<DispatchError>();
        let mut units = JoinSet::new();

        info!(queue = %self.shared.queue, "waiting for messages");
        let mut result = loop {
            while units.try_join_next().is_some() {}

            tokio::select! {
                biased;

                Some(err) = fatal_rx.recv() => break Err(err),

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, no longer taking deliveries");
                        break Ok(());
                    }
                }

                lease = source.next_delivery() => {
                    let Some(lease) = lease else {
                        info!("subscription ended");
                        break Ok(());
                    };
                    let span = info_span!("delivery", id = %Ulid::new(), tag = lease.delivery().tag);
                    let shared = Arc::clone(&self.shared);
                    let fatal_tx = fatal_tx.clone();
                    units.spawn(
                        async move {
                            if let Err(err) = shared.handle(lease).await {
                                let _ = fatal_tx.send(err);
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        };

        if !units.is_empty() {
            info!(in_flight = units.len(), "waiting for in-flight deliveries");
        }
        while units.join_next().await.is_some() {}

        if result.is_ok()
            && let Ok(err) = fatal_rx.try_recv()
        {
            result = Err(err);
        }
        result
    }
}

impl Shared {
    async fn handle(&self, lease: Box<dyn DeliveryLease>) -> Result<(), DispatchError> {
        info!("reading delivery");
        let delivery = lease.delivery().clone();

        let payload = if self.compression {
            match codec::decompress(&delivery.body) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "could not decompress delivery, requeueing");
                    self.settle(lease, Disposition::NackRequeue).await;
                    return Ok(());
                }
            }
        } else {
            delivery.body.clone()
        };

        let count = if self.decider.is_dead_letter() {
            match RetryCount::from_headers(&delivery.headers) {
                Ok(count) => count,
                Err(source) if self.on_malformed == MalformedRetryHeader::TreatAsZero => {
                    warn!(error = %source, "malformed retry header, treating as zero");
                    RetryCount::ZERO
                }
                Err(source) => {
                    error!(error = %source, "could not parse retry header");
                    self.settle(lease, Disposition::NackRequeue).await;
                    return Err(DispatchError::RetryHeader {
                        tag: delivery.tag,
                        source,
                    });
                }
            }
        } else {
            RetryCount::ZERO
        };
        if let Some(max) = self.decider.max_retries() {
            info!(retry_count = %count, max_retries = max, "retry state");
        }

        let command = self.factory.create(&payload);
        let success = self.runner.run(command, &delivery.body).await;

        let transition = self.decider.decide(success, count);
        match transition {
            Transition::FailedRetryable { to, .. } => self.republish(&delivery, to).await,
            Transition::FailedExhausted { count } => {
                warn!(retry_count = %count, "retries exhausted, rejecting")
            }
            Transition::Succeeded | Transition::Failed => {}
        }
        self.settle(lease, transition.disposition()).await;
        Ok(())
    }

    /// Failures are logged only. The original is acked either way.
    async fn republish(&self, delivery: &Delivery, next: RetryCount) {
        let Some(publisher) = &self.publisher else {
            error!("retry requested without a publisher");
            self.stats.record_republish(false);
            return;
        };
        let publication = Publication::retry_of(delivery, next.stamp(&delivery.headers), Utc::now());
        match publisher.publish(&self.queue, publication).await {
            Ok(()) => {
                info!(retry_count = %next, "republished for retry");
                self.stats.record_republish(true);
            }
            Err(e) => {
                error!(error = %e, "error republishing");
                self.stats.record_republish(false);
            }
        }
    }

    async fn settle(&self, lease: Box<dyn DeliveryLease>, disposition: Disposition) {
        let tag = lease.delivery().tag;
        self.stats.record(disposition);
        if let Err(e) = ports::settle(lease, disposition).await {
            error!(tag, ?disposition, error = %e, "failed to settle delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandError};
    use crate::domain::{HeaderValue, RETRY_COUNT_HEADER};
    use crate::impls::InMemoryBroker;
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(5);

    /// Records payloads and answers with a fixed result.
    struct StubFactory {
        succeed: bool,
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl StubFactory {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn created(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    struct StubCommand(bool);

    #[async_trait]
    impl Command for StubCommand {
        async fn execute(self: Box<Self>) -> Result<Vec<u8>, CommandError> {
            if self.0 {
                Ok(b"ok".to_vec())
            } else {
                Err(CommandError::HttpStatus("boom".into()))
            }
        }
    }

    impl CommandFactory for StubFactory {
        fn create(&self, payload: &[u8]) -> Box<dyn Command> {
            self.payloads.lock().unwrap().push(payload.to_vec());
            Box::new(StubCommand(self.succeed))
        }
    }

    fn retry_header(p: &Publication) -> Option<&HeaderValue> {
        p.headers.get(RETRY_COUNT_HEADER)
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn success_is_acked() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let factory = StubFactory::new(true);
        let dispatcher = Dispatcher::builder("jobs", factory.clone(), Runner::new())
            .dead_letter(2, broker.clone())
            .build();

        broker.deliver(Delivery::new(0, "hello")).await.unwrap();
        broker.close().await;
        dispatcher.run(source).await.unwrap();

        assert_eq!(broker.settlements().await, vec![(1, Disposition::Ack)]);
        assert!(broker.publications().await.is_empty());
        assert_eq!(factory.payloads.lock().unwrap()[0], b"hello");
        assert_eq!(dispatcher.stats().acked, 1);
    }

    #[tokio::test]
    async fn max_two_retries_give_ack_ack_reject() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(false), Runner::new())
            .dead_letter(2, broker.clone())
            .build();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(source).await }
        });

        broker.deliver(Delivery::new(0, "job")).await.unwrap();
        let mut settled = broker.wait_for_settlements(3, WAIT).await;
        settled.sort_by_key(|(tag, _)| *tag);
        broker.close().await;
        run.await.unwrap().unwrap();

        assert_eq!(
            settled,
            vec![(1, Disposition::Ack), (2, Disposition::Ack), (3, Disposition::Reject)]
        );
        let published = broker.publications().await;
        assert_eq!(published.len(), 2);
        assert_eq!(retry_header(&published[0].1), Some(&HeaderValue::text("1")));
        assert_eq!(retry_header(&published[1].1), Some(&HeaderValue::text("2")));
        assert!(published.iter().all(|(queue, _)| queue == "jobs"));

        let stats = dispatcher.stats();
        assert_eq!((stats.acked, stats.rejected, stats.republished), (2, 1, 2));
    }

    #[tokio::test]
    async fn missing_header_behaves_like_zero() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(false), Runner::new())
            .dead_letter(1, broker.clone())
            .build();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(source).await }
        });

        broker.deliver(Delivery::new(0, "a")).await.unwrap();
        broker
            .deliver(Delivery::new(0, "b").with_header(RETRY_COUNT_HEADER, HeaderValue::text("0")))
            .await
            .unwrap();
        broker.wait_for_settlements(4, WAIT).await;
        broker.close().await;
        run.await.unwrap().unwrap();

        let published = broker.publications().await;
        assert_eq!(published.len(), 2);
        for (_, p) in &published {
            assert_eq!(retry_header(p), Some(&HeaderValue::text("1")));
        }
        assert_eq!(dispatcher.stats().rejected, 2);
    }

    #[tokio::test]
    async fn republish_preserves_body_and_properties() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(false), Runner::new())
            .dead_letter(1, broker.clone())
            .build();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(source).await }
        });

        let original = Delivery::new(0, vec![0u8, 159, 146, 150])
            .with_content_type("application/x-thing")
            .with_content_encoding("gzip")
            .with_header("trace", HeaderValue::text("abc"));
        broker.deliver(original.clone()).await.unwrap();
        broker.wait_for_settlements(2, WAIT).await;
        broker.close().await;
        run.await.unwrap().unwrap();

        let (_, p) = &broker.publications().await[0];
        assert_eq!(p.body, original.body);
        assert_eq!(p.content_type, original.content_type);
        assert_eq!(p.content_encoding, original.content_encoding);
        assert_eq!(p.headers.get("trace"), Some(&HeaderValue::text("abc")));
        assert_eq!(p.headers.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_compressed_body_is_requeued_without_running() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let factory = StubFactory::new(true);
        let dispatcher = Dispatcher::builder("jobs", factory.clone(), Runner::new())
            .compression(true)
            .dead_letter(3, broker.clone())
            .build();

        broker.deliver(Delivery::new(0, "not zlib at all")).await.unwrap();
        broker.close().await;
        dispatcher.run(source).await.unwrap();

        assert_eq!(broker.settlements().await, vec![(1, Disposition::NackRequeue)]);
        assert_eq!(factory.created(), 0);
        assert!(broker.publications().await.is_empty());
    }

    #[tokio::test]
    async fn compressed_body_is_decoded_before_the_command() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let factory = StubFactory::new(true);
        let dispatcher = Dispatcher::builder("jobs", factory.clone(), Runner::new())
            .compression(true)
            .build();

        broker.deliver(Delivery::new(0, zlib(b"inflated"))).await.unwrap();
        broker.close().await;
        dispatcher.run(source).await.unwrap();

        assert_eq!(broker.settlements().await, vec![(1, Disposition::Ack)]);
        assert_eq!(factory.payloads.lock().unwrap()[0], b"inflated");
    }

    #[tokio::test]
    async fn without_dead_letter_a_failure_is_rejected_and_never_republished() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(false), Runner::new()).build();

        broker
            .deliver(Delivery::new(0, "x").with_header(RETRY_COUNT_HEADER, HeaderValue::text("0")))
            .await
            .unwrap();
        broker
            .deliver(Delivery::new(0, "y").with_header(RETRY_COUNT_HEADER, HeaderValue::text("junk")))
            .await
            .unwrap();
        broker.close().await;
        dispatcher.run(source).await.unwrap();

        let mut settled = broker.settlements().await;
        settled.sort_by_key(|(tag, _)| *tag);
        assert_eq!(settled, vec![(1, Disposition::Reject), (2, Disposition::Reject)]);
        assert!(broker.publications().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_header_halts_the_worker_after_requeueing() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let factory = StubFactory::new(true);
        let dispatcher = Dispatcher::builder("jobs", factory.clone(), Runner::new())
            .dead_letter(2, broker.clone())
            .build();

        broker
            .deliver(Delivery::new(0, "x").with_header(RETRY_COUNT_HEADER, HeaderValue::text("many")))
            .await
            .unwrap();
        // broker stays open: the halt alone must end the run
        let err = tokio::time::timeout(WAIT, dispatcher.run(source))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, DispatchError::RetryHeader { tag: 1, .. }));
        assert_eq!(broker.settlements().await, vec![(1, Disposition::NackRequeue)]);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn malformed_header_can_be_treated_as_zero() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(false), Runner::new())
            .dead_letter(1, broker.clone())
            .on_malformed_retry_header(MalformedRetryHeader::TreatAsZero)
            .build();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(source).await }
        });

        broker
            .deliver(Delivery::new(0, "x").with_header(RETRY_COUNT_HEADER, HeaderValue::text("many")))
            .await
            .unwrap();
        let mut settled = broker.wait_for_settlements(2, WAIT).await;
        settled.sort_by_key(|(tag, _)| *tag);
        broker.close().await;
        run.await.unwrap().unwrap();

        assert_eq!(settled, vec![(1, Disposition::Ack), (2, Disposition::Reject)]);
        let (_, p) = &broker.publications().await[0];
        assert_eq!(retry_header(p), Some(&HeaderValue::text("1")));
    }

    #[tokio::test]
    async fn failed_republish_still_acks_the_original() {
        let (broker, source) = InMemoryBroker::new("jobs");
        broker.fail_publishes(true);
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(false), Runner::new())
            .dead_letter(3, broker.clone())
            .build();

        broker.deliver(Delivery::new(0, "x")).await.unwrap();
        broker.close().await;
        dispatcher.run(source).await.unwrap();

        assert_eq!(broker.settlements().await, vec![(1, Disposition::Ack)]);
        let stats = dispatcher.stats();
        assert_eq!((stats.acked, stats.publish_failures), (1, 1));
    }

    #[tokio::test]
    async fn every_delivery_is_settled_exactly_once() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(true), Runner::new())
            .dead_letter(2, broker.clone())
            .build();

        for i in 0..50u8 {
            broker.deliver(Delivery::new(0, vec![i])).await.unwrap();
        }
        broker.close().await;
        dispatcher.run(source).await.unwrap();

        let mut tags: Vec<u64> = broker.settlements().await.into_iter().map(|(t, _)| t).collect();
        tags.sort();
        assert_eq!(tags, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn shutdown_stops_taking_deliveries() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let dispatcher = Dispatcher::builder("jobs", StubFactory::new(true), Runner::new()).build();
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run_until(source, rx).await }
        });

        broker.deliver(Delivery::new(0, "x")).await.unwrap();
        broker.wait_for_settlements(1, WAIT).await;
        tx.send(true).unwrap();

        tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
        assert_eq!(broker.settlements().await, vec![(1, Disposition::Ack)]);
    }

    /// Commands for the payload `slow` wait on the gate; all others finish at once.
    struct GatedFactory {
        gate: Arc<Notify>,
    }

    struct GatedCommand(Option<Arc<Notify>>);

    #[async_trait]
    impl Command for GatedCommand {
        async fn execute(self: Box<Self>) -> Result<Vec<u8>, CommandError> {
            if let Some(gate) = self.0 {
                gate.notified().await;
            }
            Ok(Vec::new())
        }
    }

    impl CommandFactory for GatedFactory {
        fn create(&self, payload: &[u8]) -> Box<dyn Command> {
            let gate = (payload == b"slow").then(|| Arc::clone(&self.gate));
            Box::new(GatedCommand(gate))
        }
    }

    #[tokio::test]
    async fn blocked_unit_does_not_hold_up_others() {
        let (broker, source) = InMemoryBroker::new("jobs");
        let gate = Arc::new(Notify::new());
        let factory = Arc::new(GatedFactory {
            gate: Arc::clone(&gate),
        });
        let dispatcher = Dispatcher::builder("jobs", factory, Runner::new()).build();
        let run = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(source).await }
        });

        broker.deliver(Delivery::new(0, "slow")).await.unwrap();
        broker.deliver(Delivery::new(0, "fast")).await.unwrap();

        let settled = broker.wait_for_settlements(1, WAIT).await;
        assert_eq!(settled, vec![(2, Disposition::Ack)]);

        gate.notify_one();
        let mut settled = broker.wait_for_settlements(2, WAIT).await;
        settled.sort_by_key(|(tag, _)| *tag);
        assert_eq!(settled, vec![(1, Disposition::Ack), (2, Disposition::Ack)]);

        broker.close().await;
        run.await.unwrap().unwrap();
    }
}
