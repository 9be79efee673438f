//! In-memory broker used by the pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::broker::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, InboundMessage, OutboundMessage,
    Topology,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Declare { topology: Topology, routing_keys: Vec<String> },
    Ack(u64),
    Nack(u64),
    Publish(OutboundMessage),
    Get(String),
}

#[derive(Default)]
pub struct RecordingChannel {
    calls: Mutex<Vec<Call>>,
    queued: Mutex<VecDeque<InboundMessage>>,
    pub fail_publish: AtomicBool,
    pub fail_ack: AtomicBool,
    pub fail_get: AtomicBool,
    pub fail_declare: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_queued(messages: Vec<InboundMessage>) -> Arc<Self> {
        let channel = Self::default();
        *channel.queued.lock().unwrap() = messages.into();
        Arc::new(channel)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Ack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn nacks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Nack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn gets(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Get(_)))
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn declare_topology(
        &self,
        topology: &Topology,
        routing_keys: &[String],
    ) -> Result<(), BrokerError> {
        self.record(Call::Declare {
            topology: topology.clone(),
            routing_keys: routing_keys.to_vec(),
        });
        if self.fail_declare.load(Ordering::SeqCst) {
            return Err(BrokerError::Topology("exchange unavailable".to_string()));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.record(Call::Ack(delivery_tag));
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(BrokerError::Ack {
                delivery_tag,
                reason: "channel closed".to_string(),
            });
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.record(Call::Nack(delivery_tag));
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let exchange = message.exchange.clone();
        let routing_key = message.routing_key.clone();
        self.record(Call::Publish(message));
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                exchange,
                routing_key,
                reason: "exchange unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>, BrokerError> {
        self.record(Call::Get(queue.to_string()));
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(BrokerError::Get {
                queue: queue.to_string(),
                reason: "channel closed".to_string(),
            });
        }
        Ok(self.queued.lock().unwrap().pop_front())
    }
}

pub struct RecordingSession {
    channel: Arc<RecordingChannel>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerSession for RecordingSession {
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out sessions over one shared `RecordingChannel`.
pub struct RecordingConnector {
    pub channel: Arc<RecordingChannel>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub fail_open: AtomicBool,
}

impl RecordingConnector {
    pub fn new(channel: Arc<RecordingChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            fail_open: AtomicBool::new(false),
        })
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for RecordingConnector {
    async fn open(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        Ok(Box::new(RecordingSession {
            channel: self.channel.clone(),
            closes: self.closes.clone(),
        }))
    }
}

pub fn message(delivery_tag: u64, routing_key: &str, content: &[u8]) -> InboundMessage {
    InboundMessage {
        delivery_tag,
        routing_key: routing_key.to_string(),
        content: content.to_vec(),
        redrive_count: 0,
    }
}
