//! Scheduled redrive of failed messages.
//!
//! Each run opens its own connection, pulls at most `fetch_limit` messages
//! one `basic.get` at a time, replays them through the same dispatcher as the
//! live consumer and closes the connection, whatever happened. A retryable
//! failure here is nacked rather than redriven again: this queue already is
//! the redrive target, so the broker dead-letters it for manual inspection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerConnector, InboundMessage, Topology};
use super::dispatcher::{Dispatcher, HandlerOutcome, Verdict};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pull operations issued.
    pub pulls: u32,
    pub acked: u32,
    pub nacked: u32,
    pub empty: u32,
    pub errors: u32,
    /// Shutdown arrived while the run was waiting to close.
    pub interrupted: bool,
}

impl SweepReport {
    /// Pulls that returned a message.
    pub fn pulled(&self) -> u32 {
        self.acked + self.nacked
    }
}

pub struct SalvageSweep {
    connector: Arc<dyn BrokerConnector>,
    dispatcher: Arc<Dispatcher>,
    topology: Topology,
    fetch_limit: u32,
    close_grace: Duration,
    metrics: Arc<Metrics>,
}

impl SalvageSweep {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        dispatcher: Arc<Dispatcher>,
        topology: Topology,
        fetch_limit: u32,
        close_grace: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connector,
            dispatcher,
            topology,
            fetch_limit,
            close_grace,
            metrics,
        }
    }

    /// `shutdown` cuts the close grace short; the connection is closed either way.
    pub async fn run(&self, shutdown: &Notify) -> SweepReport {
        let mut report = SweepReport::default();

        let session = match self.connector.open().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Unable to connect to RabbitMQ for salvage sweep");
                self.metrics
                    .sweep_runs_total
                    .with_label_values(&["connect_failed"])
                    .inc();
                return report;
            }
        };
        let channel = session.channel();

        let routing_keys = self.dispatcher.registry().routing_keys();
        match channel.declare_topology(&self.topology, &routing_keys).await {
            Ok(()) => {
                debug!(queue = %self.topology.queue, "Asserted sweep exchange and queue");
                self.drain(channel.as_ref(), &mut report).await;
            }
            Err(e) => {
                error!(error = %e, queue = %self.topology.queue, "Failed to assert sweep topology");
                self.metrics
                    .sweep_runs_total
                    .with_label_values(&["topology_failed"])
                    .inc();
            }
        }

        if report.pulled() >= self.fetch_limit && !self.close_grace.is_zero() {
            debug!(
                grace_ms = self.close_grace.as_millis() as u64,
                "Fetch limit reached, delaying close to let acks flush"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.close_grace) => {}
                _ = shutdown.notified() => {
                    info!("Shutdown signal received, closing salvage sweep connection early");
                    report.interrupted = true;
                }
            }
        }

        if let Err(e) = session.close().await {
            error!(error = %e, "Failed to close salvage sweep connection");
        }

        info!(
            queue = %self.topology.queue,
            pulls = report.pulls,
            acked = report.acked,
            nacked = report.nacked,
            empty = report.empty,
            errors = report.errors,
            "Salvage sweep finished"
        );

        report
    }

    async fn drain(&self, channel: &dyn BrokerChannel, report: &mut SweepReport) {
        while report.pulls < self.fetch_limit {
            report.pulls += 1;

            match channel.get(&self.topology.queue).await {
                Ok(Some(message)) => {
                    if self.replay(channel, message).await {
                        report.acked += 1;
                        self.count_pull("acked");
                    } else {
                        report.nacked += 1;
                        self.count_pull("nacked");
                    }
                }
                Ok(None) => {
                    debug!(attempt = report.pulls, "Processed empty message");
                    report.empty += 1;
                    self.count_pull("empty");
                }
                Err(e) => {
                    warn!(error = %e, attempt = report.pulls, "Pull failed");
                    report.errors += 1;
                    self.count_pull("error");
                }
            }
        }

        self.metrics
            .sweep_runs_total
            .with_label_values(&["completed"])
            .inc();
    }

    /// Returns true when the message was acked, false when nacked.
    async fn replay(&self, channel: &dyn BrokerChannel, message: InboundMessage) -> bool {
        let delivery_tag = message.delivery_tag;

        let ack = match self.dispatcher.process(&message).await {
            Verdict::Dispatched(HandlerOutcome::Success) => {
                debug!(delivery_tag, "Processed message");
                true
            }
            Verdict::Malformed(_)
            | Verdict::Dispatched(HandlerOutcome::RecoverableFailure {
                should_ack: true, ..
            }) => true,
            Verdict::Dispatched(HandlerOutcome::RecoverableFailure { reason, .. })
            | Verdict::Dispatched(HandlerOutcome::FatalFailure { reason }) => {
                error!(
                    delivery_tag,
                    routing_key = %message.routing_key,
                    redrive_count = message.redrive_count,
                    reason = %reason,
                    "Unable to process one of the messages"
                );
                false
            }
        };

        let result = if ack {
            channel.ack(delivery_tag).await
        } else {
            channel.nack(delivery_tag).await
        };
        match result {
            Ok(()) if !ack => self.metrics.messages_parked_total.inc(),
            Ok(()) => {}
            Err(e) => error!(error = %e, delivery_tag, "Failed to settle salvaged message"),
        }

        ack
    }

    fn count_pull(&self, result: &str) {
        self.metrics
            .sweep_pulls_total
            .with_label_values(&[result])
            .inc();
    }
}

/// Runs the sweep on a fixed period until shut down. Runs never overlap.
pub struct SweepScheduler {
    sweep: Arc<SalvageSweep>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl SweepScheduler {
    pub fn new(sweep: Arc<SalvageSweep>, interval: Duration, shutdown: Arc<Notify>) -> Self {
        Self {
            sweep,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "Salvage sweep scheduled");

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, stopping salvage sweep schedule");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("Starting scheduled salvage sweep");
                    if self.sweep.run(&self.shutdown).await.interrupted {
                        info!("Salvage sweep interrupted by shutdown, stopping schedule");
                        break;
                    }
                }
            }
        }
    }
}
