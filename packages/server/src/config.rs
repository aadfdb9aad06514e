use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Broker server, e.g. `nats://localhost:4222`
    pub broker_url: String,
    /// Subject the sensor fleet publishes readings on
    pub broker_topic: String,
    /// Hard cap on concurrently registered stream clients
    pub max_clients: usize,
    /// Per-client pending event queue capacity
    pub max_queue_size: usize,
    /// Idle threshold after which the reaper evicts a client
    pub client_max_age: Duration,
    /// How often the reaper sweeps the registry
    pub cleanup_interval: Duration,
    /// Silence gap before the stream handler emits a heartbeat frame
    pub heartbeat_interval: Duration,
    /// Fixed delay between broker reconnect attempts
    pub reconnect_backoff: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            broker_url: env::var("BROKER_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            broker_topic: env::var("BROKER_TOPIC")
                .unwrap_or_else(|_| "bsf_monitor.larvae_data".to_string()),
            max_clients: parse_var("MAX_CLIENTS", 50)?,
            max_queue_size: parse_var("MAX_QUEUE_SIZE", 10)?,
            client_max_age: Duration::from_secs(parse_var("CLIENT_MAX_AGE_SECS", 120)?),
            cleanup_interval: Duration::from_secs(parse_var("CLEANUP_INTERVAL_SECS", 60)?),
            heartbeat_interval: Duration::from_secs(parse_var("HEARTBEAT_INTERVAL_SECS", 25)?),
            reconnect_backoff: Duration::from_secs(parse_var("RECONNECT_BACKOFF_SECS", 30)?),
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}
