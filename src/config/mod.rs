use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::messaging::Topology;

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub service_name: String,
    pub rust_log: String,
    pub broker: BrokerConfig,
    pub sweep: SweepConfig,
    pub metrics_port: u16,
    pub crm: CrmConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub projects_exchange: String,
    pub projects_queue: String,
    pub connect2sf_exchange: String,
    pub connect2sf_queue: String,
    pub prefetch_count: u16,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub fetch_limit: u32,
    pub close_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub instance_url: String,
    pub access_token: String,
    pub api_version: String,
    pub campaign_id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub url: String,
    pub token: String,
}

pub const FAILED_QUEUE_SUFFIX: &str = crate::contracts::routing_key::FAILED_SUFFIX;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::MissingRequired(key));
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let rabbitmq_url = required("RABBITMQ_URL")?;
        let service_name = required("SERVICE_NAME")?;
        let rust_log = or_default("RUST_LOG", "info");

        let broker = BrokerConfig {
            projects_exchange: or_default("PROJECTS_EXCHANGE", "projects"),
            projects_queue: or_default("PROJECTS_QUEUE", "project.connect2sf"),
            connect2sf_exchange: or_default("CONNECT2SF_EXCHANGE", "connect2sf"),
            connect2sf_queue: or_default("CONNECT2SF_QUEUE", "connect2sf.failed-events"),
            prefetch_count: parse_or(&lookup, "PREFETCH_COUNT", 10)?,
        };

        if broker.prefetch_count == 0 {
            return Err(ConfigError::Invalid {
                key: "PREFETCH_COUNT",
                reason: "must be at least 1".to_string(),
            });
        }

        let sweep = SweepConfig {
            interval: Duration::from_secs(parse_or(&lookup, "SWEEP_INTERVAL_SECS", 300)?),
            fetch_limit: parse_or(&lookup, "SWEEP_FETCH_LIMIT", 10)?,
            close_grace: Duration::from_millis(parse_or(&lookup, "SWEEP_CLOSE_GRACE_MS", 30_000)?),
        };

        if sweep.interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SWEEP_INTERVAL_SECS",
                reason: "must be at least 1".to_string(),
            });
        }

        let crm = CrmConfig {
            instance_url: required("CRM_INSTANCE_URL")?,
            access_token: required("CRM_ACCESS_TOKEN")?,
            api_version: or_default("CRM_API_VERSION", "v44.0"),
            campaign_id: required("CRM_CAMPAIGN_ID")?,
            owner_id: required("CRM_OWNER_ID")?,
        };

        let identity = IdentityConfig {
            url: required("IDENTITY_SERVICE_URL")?,
            token: required("IDENTITY_SERVICE_TOKEN")?,
        };

        Ok(Self {
            rabbitmq_url,
            service_name,
            rust_log,
            broker,
            sweep,
            metrics_port: parse_or(&lookup, "METRICS_PORT", 9090)?,
            crm,
            identity,
        })
    }

    /// Exchange/queue pair the live consumer binds.
    pub fn live_topology(&self) -> Topology {
        Topology::new(&self.broker.projects_exchange, &self.broker.projects_queue)
    }

    /// Exchange/queue pair failed messages are redriven into. Sweep nacks
    /// dead-letter into `<queue>.failed`.
    pub fn redrive_topology(&self) -> Topology {
        Topology::new(&self.broker.connect2sf_exchange, &self.broker.connect2sf_queue)
            .with_dead_letter_queue(self.dead_letter_queue())
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}{}", self.broker.connect2sf_queue, FAILED_QUEUE_SUFFIX)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
