pub mod config;
pub mod contracts;
pub mod crm;
pub mod handlers;
pub mod lifecycle;
pub mod messaging;
pub mod metrics;
