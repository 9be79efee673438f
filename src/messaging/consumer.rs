use futures::{Stream, StreamExt};
use lapin::{Channel, options::BasicConsumeOptions, types::FieldTable};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use super::broker::{BrokerChannel, InboundMessage, OutboundMessage, Topology};
use super::channel::LapinChannel;
use super::dispatcher::{Dispatcher, HandlerOutcome, Verdict};
use crate::metrics::Metrics;

/// Terminal state of one live delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveDisposition {
    /// Handler succeeded, message acked.
    Committed,
    /// Malformed or permanently rejected, acked without redrive.
    Dropped,
    /// No handler for the key, nacked without requeue.
    Rejected,
    /// Acked and republished to the redrive exchange.
    Redriven,
    /// Acked but the redrive publish failed; the message is gone.
    Lost,
    /// The ack itself failed; the broker will redeliver.
    Unacknowledged,
}

/// Ack/redrive policy for deliveries from the live queue.
pub struct LiveProcessor {
    queue: String,
    acker: Arc<dyn BrokerChannel>,
    publisher: Arc<dyn BrokerChannel>,
    dispatcher: Arc<Dispatcher>,
    redrive_exchange: String,
    metrics: Arc<Metrics>,
}

impl LiveProcessor {
    pub fn new(
        queue: impl Into<String>,
        acker: Arc<dyn BrokerChannel>,
        publisher: Arc<dyn BrokerChannel>,
        dispatcher: Arc<Dispatcher>,
        redrive_exchange: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue: queue.into(),
            acker,
            publisher,
            dispatcher,
            redrive_exchange: redrive_exchange.into(),
            metrics,
        }
    }

    pub async fn process_message(&self, message: InboundMessage) -> LiveDisposition {
        let delivery_tag = message.delivery_tag;

        info!(
            delivery_tag,
            routing_key = %message.routing_key,
            redrive_count = message.redrive_count,
            payload_size = message.content.len(),
            "Processing message"
        );

        let start = Instant::now();
        let verdict = self.dispatcher.process(&message).await;
        let duration = start.elapsed().as_secs_f64();
        let label = verdict.label();

        self.metrics
            .message_processing_duration_seconds
            .with_label_values(&[&self.queue, label])
            .observe(duration);

        match verdict {
            Verdict::Dispatched(HandlerOutcome::Success) => {
                self.metrics
                    .messages_processed_total
                    .with_label_values(&[&self.queue, &message.routing_key])
                    .inc();

                if !self.ack(delivery_tag).await {
                    return LiveDisposition::Unacknowledged;
                }
                info!(delivery_tag, duration_ms = duration * 1000.0, "Message processed successfully");
                LiveDisposition::Committed
            }
            Verdict::Malformed(_)
            | Verdict::Dispatched(HandlerOutcome::RecoverableFailure {
                should_ack: true, ..
            }) => {
                self.count_failure(label);

                if !self.ack(delivery_tag).await {
                    return LiveDisposition::Unacknowledged;
                }
                LiveDisposition::Dropped
            }
            Verdict::Dispatched(HandlerOutcome::FatalFailure { reason }) => {
                self.count_failure("unroutable");

                error!(delivery_tag, reason = %reason, "NACKing message without redrive");
                if let Err(e) = self.acker.nack(delivery_tag).await {
                    error!(error = %e, delivery_tag, "Failed to nack message");
                }
                LiveDisposition::Rejected
            }
            Verdict::Dispatched(HandlerOutcome::RecoverableFailure {
                should_ack: false,
                reason,
            }) => {
                self.count_failure("retryable");

                // Ack first so a struggling dependency never pins the prefetch window.
                if !self.ack(delivery_tag).await {
                    return LiveDisposition::Unacknowledged;
                }
                self.redrive(message, &reason).await
            }
        }
    }

    /// Republishes to the redrive exchange under the original key. The sweep
    /// gets one more attempt; its nack dead-letters the message.
    async fn redrive(&self, message: InboundMessage, reason: &str) -> LiveDisposition {
        let delivery_tag = message.delivery_tag;
        let next_count = message.redrive_count.saturating_add(1);

        let outbound = OutboundMessage::new(
            &self.redrive_exchange,
            &message.routing_key,
            message.content,
        )
        .with_redrive_count(next_count)
        .with_error("retryable", reason);

        match self.publisher.publish(outbound).await {
            Ok(()) => {
                self.metrics.messages_redriven_total.inc();
                warn!(
                    delivery_tag,
                    routing_key = %message.routing_key,
                    redrive_count = next_count,
                    exchange = %self.redrive_exchange,
                    reason,
                    "Message redriven for the salvage sweep"
                );
                LiveDisposition::Redriven
            }
            Err(e) => {
                // The original is already acked; there is nothing left to retry.
                self.metrics.redrive_publish_failures_total.inc();
                error!(
                    error = %e,
                    delivery_tag,
                    exchange = %self.redrive_exchange,
                    "Error publishing redrive copy, message is lost"
                );
                LiveDisposition::Lost
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> bool {
        match self.acker.ack(delivery_tag).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, delivery_tag, "Failed to ack message");
                false
            }
        }
    }

    fn count_failure(&self, error_type: &str) {
        self.metrics
            .messages_failed_total
            .with_label_values(&[&self.queue, error_type])
            .inc();
    }
}

/// Push consumer on the live queue.
pub struct LiveConsumer {
    channel: Channel,
    topology: Topology,
    consumer_tag: String,
    prefetch_count: u16,
    processor: Arc<LiveProcessor>,
    shutdown: Arc<Notify>,
    metrics: Arc<Metrics>,
}

impl LiveConsumer {
    pub fn new(
        channel: Channel,
        topology: Topology,
        consumer_tag: String,
        prefetch_count: u16,
        processor: Arc<LiveProcessor>,
        shutdown: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            channel,
            topology,
            consumer_tag,
            prefetch_count,
            processor,
            shutdown,
            metrics,
        }
    }

    /// Binds the live queue to every routing key the registry knows.
    pub async fn setup_queues(&self) -> Result<(), ConsumerError> {
        let routing_keys = self.processor.dispatcher.registry().routing_keys();

        LapinChannel::new(self.channel.clone())
            .declare_topology(&self.topology, &routing_keys)
            .await
            .map_err(|e| ConsumerError::SetupFailed(e.to_string()))
    }

    pub async fn start(self) -> Result<(), ConsumerError> {
        info!(
            queue = %self.topology.queue,
            consumer_tag = %self.consumer_tag,
            prefetch_count = self.prefetch_count,
            "Starting RabbitMQ consumer"
        );

        let consumer = self
            .channel
            .basic_consume(
                &self.topology.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.topology.queue, "Failed to start consumer");
                ConsumerError::ConsumeFailed(e.to_string())
            })?;
        info!(
            queue = %self.topology.queue,
            consumer_tag = %self.consumer_tag,
            "Consumer started successfully"
        );

        self.metrics.active_consumers.inc();

        let deliveries =
            consumer.map(|delivery| delivery.map(|delivery| InboundMessage::from_delivery(&delivery)));
        pump(
            deliveries,
            self.processor.clone(),
            self.prefetch_count,
            &self.shutdown,
        )
        .await;

        self.metrics.active_consumers.dec();
        info!(consumer_tag = %self.consumer_tag, "Consumer stopped");
        Ok(())
    }
}

/// Feeds deliveries to the processor, at most `prefetch_count` at a time.
/// Stops taking deliveries on shutdown, then waits for in-flight ones.
async fn pump<S, E>(
    deliveries: S,
    processor: Arc<LiveProcessor>,
    prefetch_count: u16,
    shutdown: &Notify,
) where
    S: Stream<Item = Result<InboundMessage, E>>,
    E: Display,
{
    let mut deliveries = std::pin::pin!(deliveries);
    let in_flight = Arc::new(Semaphore::new(usize::from(prefetch_count)));

    loop {
        let permit = tokio::select! {
            _ = shutdown.notified() => {
                info!("Shutdown signal received, stopping consumer");
                break;
            }
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = shutdown.notified() => {
                info!("Shutdown signal received, stopping consumer");
                break;
            }

            delivery = deliveries.next() => {
                match delivery {
                    Some(Ok(message)) => {
                        let processor = processor.clone();
                        tokio::spawn(async move {
                            processor.process_message(message).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Error receiving message from RabbitMQ");
                    }
                    None => {
                        warn!("Consumer stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Wait for in-flight deliveries to settle.
    let _ = in_flight.acquire_many(u32::from(prefetch_count)).await;
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),

    #[error("Failed to setup queue topology: {0}")]
    SetupFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::HandlerError;
    use crate::messaging::handler::{HandlerMap, HandlerRegistry, handler_fn};
    use crate::messaging::testing::{RecordingChannel, message};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "project.updated";
    const REDRIVE_EXCHANGE: &str = "connect2sf";

    struct Harness {
        processor: LiveProcessor,
        acker: Arc<RecordingChannel>,
        publisher: Arc<RecordingChannel>,
        calls: Arc<AtomicUsize>,
    }

    /// The handler fails according to fields in the payload.
    fn harness() -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = HandlerRegistry::new(HandlerMap::from([(
            KEY.to_string(),
            handler_fn(move |event| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let value = event.value();
                    if value.get("rejectWithError").is_some() {
                        Err(HandlerError::retryable("CRM unavailable"))
                    } else if value.get("rejectWithUnprocessableError").is_some() {
                        Err(HandlerError::permanent("Cannot find primary customer"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )]));

        let acker = RecordingChannel::new();
        let publisher = RecordingChannel::new();
        let processor = LiveProcessor::new(
            "project.connect2sf",
            acker.clone(),
            publisher.clone(),
            Arc::new(Dispatcher::new(Arc::new(registry))),
            REDRIVE_EXCHANGE,
            Metrics::new().unwrap(),
        );

        Harness {
            processor,
            acker,
            publisher,
            calls,
        }
    }

    #[tokio::test]
    async fn test_success_acks_once_and_never_nacks() {
        let h = harness();
        let disposition = h
            .processor
            .process_message(message(1, KEY, br#"{"id": 1}"#))
            .await;

        assert_eq!(disposition, LiveDisposition::Committed);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.acker.acks(), vec![1]);
        assert!(h.acker.nacks().is_empty());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_content_acked_without_handler() {
        for (tag, raw) in [
            (1, &b"not json"[..]),
            (2, &b""[..]),
            (3, &b"{\"truncated\":"[..]),
            (4, &b"[1, 2, 3]"[..]),
        ] {
            let h = harness();
            let disposition = h.processor.process_message(message(tag, KEY, raw)).await;

            assert_eq!(disposition, LiveDisposition::Dropped);
            assert_eq!(h.acker.acks(), vec![tag]);
            assert!(h.acker.nacks().is_empty());
            assert!(h.publisher.published().is_empty());
            assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_routing_key_nacked_without_redrive() {
        for key in ["project.deleted", "project.updated.failed", ""] {
            let h = harness();
            let disposition = h.processor.process_message(message(7, key, b"{}")).await;

            assert_eq!(disposition, LiveDisposition::Rejected);
            assert_eq!(h.acker.nacks(), vec![7]);
            assert!(h.acker.acks().is_empty());
            assert!(h.publisher.published().is_empty());
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_acks_and_republishes_verbatim() {
        let h = harness();
        let content = br#"{"sampleData":"foo","rejectWithError":true}"#;
        let disposition = h.processor.process_message(message(3, KEY, content)).await;

        assert_eq!(disposition, LiveDisposition::Redriven);
        assert_eq!(h.acker.acks(), vec![3]);
        assert!(h.acker.nacks().is_empty());

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, REDRIVE_EXCHANGE);
        assert_eq!(published[0].routing_key, KEY);
        assert_eq!(published[0].content, content.to_vec());
        assert_eq!(published[0].redrive_count, 1);
        assert_eq!(published[0].error_type, Some("retryable"));
    }

    #[tokio::test]
    async fn test_permanent_failure_acks_without_republish() {
        let h = harness();
        let disposition = h
            .processor
            .process_message(message(4, KEY, br#"{"rejectWithUnprocessableError":true}"#))
            .await;

        assert_eq!(disposition, LiveDisposition::Dropped);
        assert_eq!(h.acker.acks(), vec![4]);
        assert!(h.acker.nacks().is_empty());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_redrive_publish_failure_is_swallowed() {
        let h = harness();
        h.publisher.fail_publish.store(true, Ordering::SeqCst);

        let disposition = h
            .processor
            .process_message(message(5, KEY, br#"{"rejectWithError":true}"#))
            .await;

        assert_eq!(disposition, LiveDisposition::Lost);
        assert_eq!(h.acker.acks(), vec![5]);
        assert!(h.acker.nacks().is_empty());
        assert_eq!(h.publisher.published().len(), 1);
        assert_eq!(h.processor.metrics.redrive_publish_failures_total.get(), 1.0);
    }

    #[tokio::test]
    async fn test_redrive_count_increments_from_inbound_header() {
        let h = harness();
        let mut redriven = message(6, KEY, br#"{"rejectWithError":true}"#);
        redriven.redrive_count = 1;

        assert_eq!(
            h.processor.process_message(redriven).await,
            LiveDisposition::Redriven
        );

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, REDRIVE_EXCHANGE);
        assert_eq!(published[0].redrive_count, 2);
        assert_eq!(h.acker.acks(), vec![6]);
    }

    #[tokio::test]
    async fn test_failed_ack_skips_redrive() {
        let h = harness();
        h.acker.fail_ack.store(true, Ordering::SeqCst);

        let disposition = h
            .processor
            .process_message(message(9, KEY, br#"{"rejectWithError":true}"#))
            .await;

        assert_eq!(disposition, LiveDisposition::Unacknowledged);
        assert!(h.publisher.published().is_empty());
        assert!(h.acker.nacks().is_empty());
    }

    #[tokio::test]
    async fn test_registry_swap_changes_routing() {
        let h = harness();
        h.processor
            .dispatcher
            .registry()
            .register(HandlerMap::from([(
                "project.deleted".to_string(),
                handler_fn(|_| async { Ok(()) }),
            )]));

        assert_eq!(
            h.processor.process_message(message(1, KEY, b"{}")).await,
            LiveDisposition::Rejected
        );
        assert_eq!(
            h.processor
                .process_message(message(2, "project.deleted", b"{}"))
                .await,
            LiveDisposition::Committed
        );
    }

    #[tokio::test]
    async fn test_shutdown_observed_while_waiting_for_permit() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (handler_gate, counter) = (gate.clone(), calls.clone());
        let registry = HandlerRegistry::new(HandlerMap::from([(
            KEY.to_string(),
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let gate = handler_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            }),
        )]));
        let acker = RecordingChannel::new();
        let processor = Arc::new(LiveProcessor::new(
            "project.connect2sf",
            acker.clone(),
            RecordingChannel::new(),
            Arc::new(Dispatcher::new(Arc::new(registry))),
            REDRIVE_EXCHANGE,
            Metrics::new().unwrap(),
        ));

        let deliveries = futures::stream::iter(vec![
            Ok::<_, std::convert::Infallible>(message(1, KEY, b"{}")),
            Ok(message(2, KEY, b"{}")),
        ])
        .chain(futures::stream::pending());
        let shutdown = Arc::new(Notify::new());
        let pump_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            pump(deliveries, processor, 1, &pump_shutdown).await;
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.notify_one();
        gate.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acker.acks(), vec![1]);
    }
}
