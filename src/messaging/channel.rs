use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ExchangeKind};
use tracing::{debug, error, info};

use super::broker::{BrokerChannel, BrokerError, InboundMessage, OutboundMessage, Topology};

pub struct ChannelProvider;

impl ChannelProvider {
    /// Creates a channel with `prefetch_count` as its QoS bound.
    pub async fn create_channel(
        connection: &Connection,
        prefetch_count: u16,
    ) -> Result<Channel, ChannelError> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        info!(channel_id = channel.id(), prefetch_count, "Configuring channel QoS");

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to configure channel QoS");
                ChannelError::QoSConfigurationFailed(e.to_string())
            })?;

        info!(
            channel_id = channel.id(),
            prefetch_count,
            "Channel QoS configured successfully"
        );

        Ok(channel)
    }

    /// Creates a publisher-confirm channel for republishing.
    pub async fn create_confirm_channel(connection: &Connection) -> Result<Channel, ChannelError> {
        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ publish channel");
            ChannelError::CreationFailed(e.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to enable publisher confirms");
                ChannelError::ConfirmSelectFailed(e.to_string())
            })?;

        info!(channel_id = channel.id(), "Publish channel created with confirms");
        Ok(channel)
    }

    pub async fn close_channel(channel: &Channel) -> Result<(), ChannelError> {
        let channel_id = channel.id();
        info!(channel_id, "Closing RabbitMQ channel");

        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            ChannelError::CloseFailed(e.to_string())
        })?;

        info!(channel_id, "Channel closed successfully");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to create channel: {0}")]
    CreationFailed(String),

    #[error("Failed to configure channel QoS: {0}")]
    QoSConfigurationFailed(String),

    #[error("Failed to enable publisher confirms: {0}")]
    ConfirmSelectFailed(String),

    #[error("Failed to close channel: {0}")]
    CloseFailed(String),
}

/// `BrokerChannel` over a lapin channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_topology(
        &self,
        topology: &Topology,
        routing_keys: &[String],
    ) -> Result<(), BrokerError> {
        let durable = || QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("exchange {}: {}", topology.exchange, e)))?;

        let mut queue_args = FieldTable::default();
        if let Some(dlq) = &topology.dead_letter_queue {
            self.channel
                .queue_declare(dlq, durable(), FieldTable::default())
                .await
                .map_err(|e| BrokerError::Topology(format!("queue {}: {}", dlq, e)))?;

            queue_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString("".into()),
            );
            queue_args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dlq.as_str().into()),
            );
        }

        self.channel
            .queue_declare(&topology.queue, durable(), queue_args)
            .await
            .map_err(|e| BrokerError::Topology(format!("queue {}: {}", topology.queue, e)))?;

        for routing_key in routing_keys {
            self.channel
                .queue_bind(
                    &topology.queue,
                    &topology.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!(
                        "bind {} -> {} ({}): {}",
                        topology.exchange, topology.queue, routing_key, e
                    ))
                })?;
        }

        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            dead_letter_queue = ?topology.dead_letter_queue,
            bindings = ?routing_keys,
            "Queue topology configured"
        );

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
            .map_err(|e| BrokerError::Nack {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let publish_error = |reason: String| BrokerError::Publish {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            reason,
        };

        let properties = BasicProperties::default()
            .with_headers(message.headers())
            .with_delivery_mode(2);

        let confirmation = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.content,
                properties,
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(publish_error("broker nacked the publish".to_string()));
        }

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            redrive_count = message.redrive_count,
            "Message published"
        );
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>, BrokerError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions::default())
            .await
            .map_err(|e| BrokerError::Get {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        Ok(message.map(|message| InboundMessage::from_delivery(&message.delivery)))
    }
}
