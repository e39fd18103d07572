use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Pause between streamed response messages.
    pub pace: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `LOOPBACK_BIND_ADDRESS`: Address to listen on. Defaults to "127.0.0.1:8000".
    /// *   `LOOPBACK_PACE_MS`: Delay between response messages. Defaults to 60.
    /// *   `RUST_LOG`: The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let bind_str =
            env::var("LOOPBACK_BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
        let bind_address = bind_str
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidValue("LOOPBACK_BIND_ADDRESS".into(), bind_str))?;

        let pace_str = env::var("LOOPBACK_PACE_MS").unwrap_or_else(|_| "60".to_string());
        let pace = pace_str
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue("LOOPBACK_PACE_MS".into(), pace_str))?;

        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            bind_address,
            pace,
            log_level,
        })
    }
}
