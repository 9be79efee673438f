use std::sync::Arc;

use async_trait::async_trait;
use lapin::BasicProperties;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};

pub const REDRIVE_COUNT_HEADER: &str = "x-redrive-count";
pub const ERROR_REASON_HEADER: &str = "x-error-reason";
pub const ERROR_TYPE_HEADER: &str = "x-error-type";

/// A message as seen by the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub content: Vec<u8>,
    pub redrive_count: u32,
}

impl InboundMessage {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.as_str().to_string(),
            content: delivery.data.clone(),
            redrive_count: redrive_count(&delivery.properties),
        }
    }
}

/// Reads the redrive counter header. Missing or unrecognised values count as 0.
pub fn redrive_count(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(REDRIVE_COUNT_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongUInt(count) => Some(*count),
            AMQPValue::LongInt(count) => u32::try_from(*count).ok(),
            AMQPValue::LongLongInt(count) => u32::try_from(*count).ok(),
            AMQPValue::ShortUInt(count) => Some(u32::from(*count)),
            AMQPValue::ShortShortUInt(count) => Some(u32::from(*count)),
            _ => None,
        })
        .unwrap_or(0)
}

/// A message to publish. Content is always copied verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content: Vec<u8>,
    pub redrive_count: u32,
    pub error_type: Option<&'static str>,
    pub error_reason: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content,
            redrive_count: 0,
            error_type: None,
            error_reason: None,
        }
    }

    pub fn with_redrive_count(mut self, count: u32) -> Self {
        self.redrive_count = count;
        self
    }

    pub fn with_error(mut self, error_type: &'static str, reason: impl Into<String>) -> Self {
        self.error_type = Some(error_type);
        self.error_reason = Some(reason.into());
        self
    }

    pub fn headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();

        if self.redrive_count > 0 {
            headers.insert(
                REDRIVE_COUNT_HEADER.into(),
                AMQPValue::LongUInt(self.redrive_count),
            );
        }
        if let Some(error_type) = self.error_type {
            headers.insert(
                ERROR_TYPE_HEADER.into(),
                AMQPValue::LongString(error_type.into()),
            );
        }
        if let Some(reason) = &self.error_reason {
            headers.insert(
                ERROR_REASON_HEADER.into(),
                AMQPValue::LongString(reason.as_str().into()),
            );
        }

        headers
    }
}

/// Durable topic exchange plus the durable queue bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub dead_letter_queue: Option<String>,
}

impl Topology {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            dead_letter_queue: None,
        }
    }

    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }
}

/// Channel operations the delivery pipeline depends on.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotently declares the topology and binds the queue to every key.
    async fn declare_topology(
        &self,
        topology: &Topology,
        routing_keys: &[String],
    ) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects without requeue.
    async fn nack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Single synchronous pull. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>, BrokerError>;
}

/// A dedicated connection with one channel on it.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn channel(&self) -> Arc<dyn BrokerChannel>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens fresh sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to declare topology: {0}")]
    Topology(String),

    #[error("Failed to ack delivery {delivery_tag}: {reason}")]
    Ack { delivery_tag: u64, reason: String },

    #[error("Failed to nack delivery {delivery_tag}: {reason}")]
    Nack { delivery_tag: u64, reason: String },

    #[error("Failed to publish to {exchange}/{routing_key}: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("Failed to pull from {queue}: {reason}")]
    Get { queue: String, reason: String },

    #[error("Failed to close: {0}")]
    Close(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redrive_count_defaults_to_zero() {
        assert_eq!(redrive_count(&BasicProperties::default()), 0);
    }

    #[test]
    fn test_redrive_count_round_trips_through_headers() {
        let outbound = OutboundMessage::new("connect2sf", "project.updated", b"{}".to_vec())
            .with_redrive_count(3)
            .with_error("retryable", "CRM timeout");
        let properties = BasicProperties::default().with_headers(outbound.headers());

        assert_eq!(redrive_count(&properties), 3);
    }

    #[test]
    fn test_redrive_count_accepts_signed_headers() {
        let mut headers = FieldTable::default();
        headers.insert(REDRIVE_COUNT_HEADER.into(), AMQPValue::LongLongInt(2));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(redrive_count(&properties), 2);

        let mut headers = FieldTable::default();
        headers.insert(REDRIVE_COUNT_HEADER.into(), AMQPValue::LongInt(-1));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(redrive_count(&properties), 0);
    }

    #[test]
    fn test_headers_omit_unset_fields() {
        let headers = OutboundMessage::new("x", "k", vec![]).headers();
        assert!(headers.inner().is_empty());
    }
}
