use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{Instrument, debug, error, info_span, warn};

use super::broker::InboundMessage;
use super::handler::HandlerRegistry;
use crate::contracts::{DecodeError, DecodedEvent, HandlerError, decode};

/// Classified result of invoking a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// The handler failed. `should_ack` is set for permanent failures, which
    /// are dropped instead of redriven.
    RecoverableFailure { should_ack: bool, reason: String },
    /// No handler for the routing key. Never redriven.
    FatalFailure { reason: String },
}

impl HandlerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RecoverableFailure {
                should_ack: true, ..
            } => "permanent",
            Self::RecoverableFailure {
                should_ack: false, ..
            } => "retryable",
            Self::FatalFailure { .. } => "unroutable",
        }
    }
}

/// What became of one inbound message before any ack decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Malformed(DecodeError),
    Dispatched(HandlerOutcome),
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Dispatched(outcome) => outcome.label(),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Resolves and runs the handler for `routing_key`. Never panics or
    /// returns an error: every failure becomes an outcome.
    pub async fn dispatch(&self, routing_key: &str, event: &DecodedEvent) -> HandlerOutcome {
        let Some(handler) = self.registry.resolve(routing_key) else {
            error!(routing_key, "Unknown routing key, no handler registered");
            return HandlerOutcome::FatalFailure {
                reason: format!("unknown routing key: {}", routing_key),
            };
        };

        let span = info_span!("dispatch", routing_key);
        let result = AssertUnwindSafe(handler.handle(event))
            .catch_unwind()
            .instrument(span)
            .await;

        match result {
            Ok(Ok(())) => {
                debug!(routing_key, "Handler completed");
                HandlerOutcome::Success
            }
            Ok(Err(err)) => {
                match &err {
                    HandlerError::Permanent { reason } => {
                        error!(routing_key, error = %err, reason = %reason, "Handler rejected message as unprocessable");
                    }
                    HandlerError::Retryable { reason } => {
                        warn!(routing_key, error = %err, reason = %reason, "Handler failed with retryable error");
                    }
                }
                HandlerOutcome::RecoverableFailure {
                    should_ack: err.should_ack(),
                    reason: err.reason().to_string(),
                }
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(routing_key, panic = %reason, "Handler panicked");
                HandlerOutcome::RecoverableFailure {
                    should_ack: false,
                    reason: format!("handler panicked: {}", reason),
                }
            }
        }
    }

    /// Runs the full decode and dispatch path shared by the live consumer and
    /// the salvage sweep. Unknown routing keys are rejected before decoding.
    pub async fn process(&self, message: &InboundMessage) -> Verdict {
        if !self.registry.contains(&message.routing_key) {
            error!(
                routing_key = %message.routing_key,
                delivery_tag = message.delivery_tag,
                "Unknown message type"
            );
            return Verdict::Dispatched(HandlerOutcome::FatalFailure {
                reason: format!("unknown routing key: {}", message.routing_key),
            });
        }

        let event = match decode(&message.content) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    routing_key = %message.routing_key,
                    delivery_tag = message.delivery_tag,
                    error = %err,
                    content = %String::from_utf8_lossy(&message.content).chars().take(200).collect::<String>(),
                    "Invalid message, ignoring"
                );
                return Verdict::Malformed(err);
            }
        };

        Verdict::Dispatched(self.dispatch(&message.routing_key, &event).await)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
