use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crm_sync_worker::config::Config;
use crm_sync_worker::crm::{IdentityApiClient, SalesforceClient};
use crm_sync_worker::handlers::{CampaignSettings, default_handlers};
use crm_sync_worker::lifecycle::Lifecycle;
use crm_sync_worker::messaging::HandlerRegistry;
use crm_sync_worker::metrics::{Metrics, server::start_metrics_server};

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        "CRM sync worker starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let crm = match SalesforceClient::new(&config.crm) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create CRM client: {}", e);
            std::process::exit(1);
        }
    };
    let identity = match IdentityApiClient::new(&config.identity) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create identity client: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(HandlerRegistry::new(default_handlers(
        crm,
        identity,
        CampaignSettings::from(&config.crm),
    )));
    info!(routing_keys = ?registry.routing_keys(), "Handlers registered");

    if let Err(e) = Lifecycle::new(config, registry, metrics).run().await {
        error!(error = %e, "Lifecycle error");
    }

    info!("CRM sync worker stopped");
}

fn setup_logging(rust_log: &str) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
