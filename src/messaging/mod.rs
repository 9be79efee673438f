pub mod broker;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod handler;
pub mod sweep;

#[cfg(test)]
pub mod testing;

pub use broker::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, InboundMessage, OutboundMessage,
    Topology,
};
pub use channel::{ChannelError, ChannelProvider, LapinChannel};
pub use connection::{ConnectionError, LapinConnector, RabbitMqConnection};
pub use consumer::{ConsumerError, LiveConsumer, LiveDisposition, LiveProcessor};
pub use dispatcher::{Dispatcher, HandlerOutcome, Verdict};
pub use handler::{EventHandler, HandlerMap, HandlerRegistry, handler_fn};
pub use sweep::{SalvageSweep, SweepReport, SweepScheduler};
