//! Process-scoped broker state.
//!
//! The live consumer and the salvage sweep never share a connection. The
//! live side holds one connection for the whole process; the sweep opens a
//! fresh one per run through its connector.

use std::sync::Arc;
use std::time::Duration;

use lapin::Channel;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::messaging::{
    BrokerChannel, BrokerError, ChannelError, ChannelProvider, ConnectionError, ConsumerError,
    Dispatcher, HandlerRegistry, LapinChannel, LapinConnector, LiveConsumer, LiveProcessor,
    RabbitMqConnection, SalvageSweep, SweepScheduler,
};
use crate::metrics::Metrics;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The running live consumer and everything it holds open.
struct LiveWorker {
    connection: RabbitMqConnection,
    consume_channel: Channel,
    publish_channel: Channel,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct SweepWorker {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct Lifecycle {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl Lifecycle {
    pub fn new(config: Config, registry: Arc<HandlerRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            dispatcher: Arc::new(Dispatcher::new(registry)),
            metrics,
        }
    }

    /// Starts both paths, then blocks until Ctrl-C and tears them down.
    pub async fn run(self) -> Result<(), LifecycleError> {
        let live = match self.start_live().await {
            Ok(live) => Some(live),
            Err(e) => {
                error!(error = %e, "Live consumer not started, running without live consumption");
                None
            }
        };

        let sweep = self.start_sweep();

        info!(
            service_name = %self.config.service_name,
            consuming = live.is_some(),
            "Ready to process project events"
        );

        tokio::signal::ctrl_c()
            .await
            .map_err(LifecycleError::Signal)?;

        warn!("Shutdown signal received, cleaning up...");

        sweep.shutdown.notify_one();
        if let Some(live) = &live {
            live.shutdown.notify_one();
        }

        join_within(sweep.handle, SHUTDOWN_TIMEOUT, "salvage sweep").await;

        if let Some(live) = live {
            join_within(live.handle, SHUTDOWN_TIMEOUT, "live consumer").await;

            for channel in [&live.consume_channel, &live.publish_channel] {
                if let Err(e) = ChannelProvider::close_channel(channel).await {
                    warn!(error = %e, "Error closing channel during shutdown");
                }
            }
            if let Err(e) = live.connection.shutdown().await {
                warn!(error = %e, "Error closing live connection during shutdown");
            }
        }

        Ok(())
    }

    async fn start_live(&self) -> Result<LiveWorker, LifecycleError> {
        let connection = RabbitMqConnection::connect(
            &self.config.rabbitmq_url,
            format!("{}-live", self.config.service_name),
        )
        .await?;

        match self.spawn_consumer(&connection).await {
            Ok((consume_channel, publish_channel, shutdown, handle)) => Ok(LiveWorker {
                connection,
                consume_channel,
                publish_channel,
                shutdown,
                handle,
            }),
            Err(e) => {
                if let Err(close_err) = connection.shutdown().await {
                    error!(error = %close_err, "Failed to close live connection after startup error");
                }
                Err(e)
            }
        }
    }

    async fn spawn_consumer(
        &self,
        connection: &RabbitMqConnection,
    ) -> Result<(Channel, Channel, Arc<Notify>, JoinHandle<()>), LifecycleError> {
        let broker = &self.config.broker;

        let consume_channel =
            ChannelProvider::create_channel(connection.get_connection(), broker.prefetch_count)
                .await?;
        let publish_channel =
            ChannelProvider::create_confirm_channel(connection.get_connection()).await?;

        let publisher = Arc::new(LapinChannel::new(publish_channel.clone()));
        let routing_keys = self.dispatcher.registry().routing_keys();

        // Redrives published before the sweep's first run must have a queue to land in.
        publisher
            .declare_topology(&self.config.redrive_topology(), &routing_keys)
            .await?;

        let processor = Arc::new(LiveProcessor::new(
            &broker.projects_queue,
            Arc::new(LapinChannel::new(consume_channel.clone())),
            publisher,
            self.dispatcher.clone(),
            &broker.connect2sf_exchange,
            self.metrics.clone(),
        ));

        let shutdown = Arc::new(Notify::new());
        let consumer = LiveConsumer::new(
            consume_channel.clone(),
            self.config.live_topology(),
            format!("{}-{}", self.config.service_name, Uuid::new_v4().simple()),
            broker.prefetch_count,
            processor,
            shutdown.clone(),
            self.metrics.clone(),
        );
        consumer.setup_queues().await?;

        let handle = tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                error!(error = %e, "Live consumer stopped with error");
            }
        });

        Ok((consume_channel, publish_channel, shutdown, handle))
    }

    fn start_sweep(&self) -> SweepWorker {
        let connector = LapinConnector::new(
            self.config.rabbitmq_url.clone(),
            format!("{}-sweep", self.config.service_name),
            self.config.broker.prefetch_count,
        );

        let sweep = SalvageSweep::new(
            Arc::new(connector),
            self.dispatcher.clone(),
            self.config.redrive_topology(),
            self.config.sweep.fetch_limit,
            self.config.sweep.close_grace,
            self.metrics.clone(),
        );

        let shutdown = Arc::new(Notify::new());
        let scheduler = SweepScheduler::new(
            Arc::new(sweep),
            self.config.sweep.interval,
            shutdown.clone(),
        );

        SweepWorker {
            shutdown,
            handle: tokio::spawn(scheduler.run()),
        }
    }
}

/// Waits for a task to finish, giving up after `timeout`. Returns whether it
/// finished in time.
async fn join_within(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, task = name, "Task failed during shutdown");
            true
        }
        Err(_) => {
            warn!(task = name, timeout_secs = timeout.as_secs(), "Shutdown timeout, abandoning task");
            false
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(std::io::Error),
}
