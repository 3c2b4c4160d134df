use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite://./spending_alerts.db";
const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_GROQ_MODEL: &str = "openai/gpt-oss-20b";

/// Runtime settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub heartbeat_every: Duration,
    pub delivery_timeout: Duration,
    pub groq: Option<GroqConfig>,
}

#[derive(Debug, Clone)]
pub struct GroqConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let bind_addr = parse_var("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let heartbeat_every = heartbeat_interval(parse_var("HEARTBEAT_SECS", 30u64)?)?;
        let delivery_timeout = Duration::from_millis(parse_var("DELIVERY_TIMEOUT_MS", 5_000u64)?);

        // enrichment is optional; without a key the service runs without it
        let groq = match env::var("GROQ_API_KEY") {
            Ok(api_key) if !api_key.trim().is_empty() => Some(GroqConfig {
                api_key,
                base_url: env::var("GROQ_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_GROQ_BASE_URL.to_string()),
                model: env::var("GROQ_MODEL").unwrap_or_else(|_| DEFAULT_GROQ_MODEL.to_string()),
                timeout: Duration::from_millis(parse_var("ENRICH_TIMEOUT_MS", 4_000u64)?),
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            bind_addr,
            heartbeat_every,
            delivery_timeout,
            groq,
        })
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Heartbeats need a non-zero period; a timer interval can't tick at zero.
fn heartbeat_interval(secs: u64) -> Result<Duration> {
    anyhow::ensure!(secs > 0, "HEARTBEAT_SECS must be at least 1, got {secs}");
    Ok(Duration::from_secs(secs))
}
