pub mod event;
pub mod processing_error;

pub use event::{DecodeError, DecodedEvent, decode, routing_key};
pub use processing_error::HandlerError;
