use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_processed_total: CounterVec,
    pub messages_failed_total: CounterVec,
    pub messages_redriven_total: Counter,
    pub messages_parked_total: Counter,
    pub redrive_publish_failures_total: Counter,
    pub message_processing_duration_seconds: HistogramVec,
    pub active_consumers: Gauge,
    pub sweep_runs_total: CounterVec,
    pub sweep_pulls_total: CounterVec,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_processed_total = CounterVec::new(
            Opts::new(
                "crm_sync_messages_processed_total",
                "Total number of messages successfully processed",
            ),
            &["queue", "routing_key"],
        )?;

        let messages_failed_total = CounterVec::new(
            Opts::new(
                "crm_sync_messages_failed_total",
                "Total number of messages that failed processing",
            ),
            &["queue", "error_type"],
        )?;

        let messages_redriven_total = Counter::new(
            "crm_sync_messages_redriven_total",
            "Total number of messages republished for the salvage sweep",
        )?;

        let messages_parked_total = Counter::new(
            "crm_sync_messages_parked_total",
            "Total number of salvaged messages nacked into the dead letter queue",
        )?;

        let redrive_publish_failures_total = Counter::new(
            "crm_sync_redrive_publish_failures_total",
            "Total number of acked messages whose redrive publish failed",
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "crm_sync_message_processing_duration_seconds",
                "Time taken to process a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "status"],
        )?;

        let active_consumers = Gauge::new(
            "crm_sync_active_consumers",
            "Number of active consumer loops",
        )?;

        let sweep_runs_total = CounterVec::new(
            Opts::new(
                "crm_sync_sweep_runs_total",
                "Total number of salvage sweep runs",
            ),
            &["result"],
        )?;

        let sweep_pulls_total = CounterVec::new(
            Opts::new(
                "crm_sync_sweep_pulls_total",
                "Total number of salvage sweep pull attempts",
            ),
            &["result"],
        )?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(messages_redriven_total.clone()))?;
        registry.register(Box::new(messages_parked_total.clone()))?;
        registry.register(Box::new(redrive_publish_failures_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;
        registry.register(Box::new(sweep_runs_total.clone()))?;
        registry.register(Box::new(sweep_pulls_total.clone()))?;

        Ok(Arc::new(Self {
            messages_processed_total,
            messages_failed_total,
            messages_redriven_total,
            messages_parked_total,
            redrive_publish_failures_total,
            message_processing_duration_seconds,
            active_consumers,
            sweep_runs_total,
            sweep_pulls_total,
            registry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_registered() {
        let metrics = Metrics::new().unwrap();
        metrics
            .messages_processed_total
            .with_label_values(&["q", "project.updated"])
            .inc();
        metrics.sweep_pulls_total.with_label_values(&["empty"]).inc();
        metrics.messages_redriven_total.inc();

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"crm_sync_messages_processed_total".to_string()));
        assert!(names.contains(&"crm_sync_sweep_pulls_total".to_string()));
        assert!(names.contains(&"crm_sync_messages_redriven_total".to_string()));
    }
}
