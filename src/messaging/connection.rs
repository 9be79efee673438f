use std::sync::Arc;

use async_trait::async_trait;
use lapin::{Connection, ConnectionProperties};
use tracing::{error, info};

use super::broker::{BrokerChannel, BrokerConnector, BrokerError, BrokerSession};
use super::channel::{ChannelProvider, LapinChannel};

pub struct RabbitMqConnection {
    connection: Connection,
    name: String,
}

impl RabbitMqConnection {
    pub async fn connect(url: &str, name: impl Into<String>) -> Result<Self, ConnectionError> {
        let name = name.into();
        info!(url = %redact(url), connection = %name, "Connecting to RabbitMQ");

        let properties = ConnectionProperties::default().with_connection_name(name.clone().into());
        let connection = Connection::connect(url, properties).await.map_err(|e| {
            error!(error = %e, url = %redact(url), "Failed to connect to RabbitMQ");
            ConnectionError::ConnectionFailed(e.to_string())
        })?;

        let connection_name = name.clone();
        connection.on_error(move |e| {
            error!(error = %e, connection = %connection_name, "RabbitMQ connection error");
        });

        info!(connection = %name, "Successfully connected to RabbitMQ");

        Ok(Self { connection, name })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        info!(connection = %self.name, "Shutting down RabbitMQ connection");

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, connection = %self.name, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!(connection = %self.name, "RabbitMQ connection closed successfully");
        Ok(())
    }
}

/// Keeps credentials out of the logs: only the host part survives.
fn redact(url: &str) -> String {
    match url.rsplit_once('@') {
        Some((scheme_and_credentials, host)) => {
            let scheme = scheme_and_credentials
                .split_once("://")
                .map(|(scheme, _)| scheme)
                .unwrap_or("amqp");
            format!("{}://***@{}", scheme, host)
        }
        None => url.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}

/// A connection owning a single channel; closing it tears down both.
pub struct LapinSession {
    connection: RabbitMqConnection,
    channel: Arc<LapinChannel>,
}

#[async_trait]
impl BrokerSession for LapinSession {
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .shutdown()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

/// Opens a brand-new connection for every session.
pub struct LapinConnector {
    url: String,
    name: String,
    prefetch_count: u16,
}

impl LapinConnector {
    pub fn new(url: impl Into<String>, name: impl Into<String>, prefetch_count: u16) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            prefetch_count,
        }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn open(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let connection = RabbitMqConnection::connect(&self.url, self.name.clone())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = match ChannelProvider::create_channel(
            connection.get_connection(),
            self.prefetch_count,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.shutdown().await {
                    error!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(BrokerError::Connect(e.to_string()));
            }
        };

        Ok(Box::new(LapinSession {
            connection,
            channel: Arc::new(LapinChannel::new(channel)),
        }))
    }
}
