use crate::client::consts::{
    DEFAULT_CAPACITY, DEFAULT_GENERATION_URL, DEFAULT_OPEN_POLL_ATTEMPTS,
    DEFAULT_OPEN_POLL_INTERVAL_MS,
};
use secrecy::SecretString;
use std::time::Duration;

/// Connection settings for one channel.
#[derive(Debug)]
pub struct Config {
    url: String,
    token: Option<SecretString>,
    capacity: usize,
    open_poll_interval: Duration,
    open_poll_attempts: u32,
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.config.url = url.to_string();
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.config.token = Some(SecretString::from(token.to_string()));
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity.max(1);
        self
    }

    pub fn with_open_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.config.open_poll_interval = interval;
        self.config.open_poll_attempts = attempts.max(1);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            url: DEFAULT_GENERATION_URL.to_string(),
            token: None,
            capacity: DEFAULT_CAPACITY,
            open_poll_interval: Duration::from_millis(DEFAULT_OPEN_POLL_INTERVAL_MS),
            open_poll_attempts: DEFAULT_OPEN_POLL_ATTEMPTS,
        }
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Longest time a connect may take before it counts as a timeout.
    pub fn open_timeout(&self) -> Duration {
        self.open_poll_interval * self.open_poll_attempts
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
