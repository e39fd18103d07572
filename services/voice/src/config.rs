//! Service configuration, loaded from the environment (and `.env` when present).

use duplex_voice::{CaptureConfig, ClientConfig, Config as LinkConfig};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_RECOGNITION_URL: &str = "ws://127.0.0.1:8000/ws/realtime-speech";
pub const DEFAULT_GENERATION_URL: &str = "ws://127.0.0.1:8000/ws";

/// Device buffer size requested from cpal, in frames.
pub const DEVICE_CHUNK_SIZE: u32 = 1024;
/// How much synthesized audio the output buffer can hold.
pub const OUTPUT_LATENCY_MS: usize = 2000;

/// How generation audio segments are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    Wav,
    Pcm16 { sample_rate: u32 },
}

#[derive(Debug)]
pub struct Config {
    pub recognition_url: String,
    pub generation_url: String,
    pub backend_token: Option<SecretString>,
    pub sample_rate: u32,
    pub frame_ms: u64,
    pub segment_format: SegmentFormat,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `VOICE_RECOGNITION_URL`: (Optional) Recognition endpoint.
    // *   `VOICE_GENERATION_URL`: (Optional) Generation endpoint.
    // *   `VOICE_BACKEND_TOKEN`: (Optional) Bearer token sent to both endpoints.
    // *   `VOICE_SAMPLE_RATE`: (Optional) Capture rate sent to recognition. Defaults to 16000.
    // *   `VOICE_FRAME_MS`: (Optional) Frame cadence in milliseconds. Defaults to 100.
    // *   `VOICE_SEGMENT_FORMAT`: (Optional) "wav" or "pcm16". Defaults to "wav".
    // *   `VOICE_SEGMENT_SAMPLE_RATE`: (Optional) Rate of pcm16 segments. Defaults to 24000.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let recognition_url = lookup("VOICE_RECOGNITION_URL")
            .unwrap_or_else(|| DEFAULT_RECOGNITION_URL.to_string());
        let generation_url =
            lookup("VOICE_GENERATION_URL").unwrap_or_else(|| DEFAULT_GENERATION_URL.to_string());
        let backend_token = lookup("VOICE_BACKEND_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);

        let sample_rate = parse_number(&lookup, "VOICE_SAMPLE_RATE", 16_000u32)?;
        let frame_ms = parse_number(&lookup, "VOICE_FRAME_MS", 100u64)?;
        if sample_rate == 0 {
            return Err(invalid("VOICE_SAMPLE_RATE", "0"));
        }
        if frame_ms == 0 {
            return Err(invalid("VOICE_FRAME_MS", "0"));
        }

        let segment_format = match lookup("VOICE_SEGMENT_FORMAT")
            .unwrap_or_else(|| "wav".to_string())
            .to_lowercase()
            .as_str()
        {
            "wav" => SegmentFormat::Wav,
            "pcm16" => SegmentFormat::Pcm16 {
                sample_rate: parse_number(&lookup, "VOICE_SEGMENT_SAMPLE_RATE", 24_000u32)?,
            },
            other => return Err(invalid("VOICE_SEGMENT_FORMAT", other)),
        };

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        for (name, url) in [
            ("VOICE_RECOGNITION_URL", &recognition_url),
            ("VOICE_GENERATION_URL", &generation_url),
        ] {
            if url.trim().is_empty() {
                return Err(ConfigError::MissingVar(name.to_string()));
            }
        }

        Ok(Self {
            recognition_url,
            generation_url,
            backend_token,
            sample_rate,
            frame_ms,
            segment_format,
            log_level,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_recognition(self.link(&self.recognition_url))
            .with_generation(self.link(&self.generation_url))
            .with_capture(
                CaptureConfig::default()
                    .with_target_sample_rate(self.sample_rate)
                    .with_frame_duration(Duration::from_millis(self.frame_ms)),
            )
    }

    fn link(&self, url: &str) -> LinkConfig {
        let builder = LinkConfig::builder().with_url(url);
        match &self.backend_token {
            Some(token) => builder.with_token(token.expose_secret()),
            None => builder,
        }
        .build()
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| invalid(name, &raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_point_at_a_local_backend() {
        let config = load(&[]).unwrap();
        assert_eq!(config.recognition_url, DEFAULT_RECOGNITION_URL);
        assert_eq!(config.generation_url, DEFAULT_GENERATION_URL);
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.frame_ms, 100);
        assert_eq!(config.segment_format, SegmentFormat::Wav);
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.backend_token.is_none());
    }

    #[test]
    fn pcm16_segments_take_their_own_rate() {
        let config = load(&[
            ("VOICE_SEGMENT_FORMAT", "PCM16"),
            ("VOICE_SEGMENT_SAMPLE_RATE", "22050"),
            ("VOICE_BACKEND_TOKEN", "abc"),
            ("RUST_LOG", "debug"),
        ])
        .unwrap();
        assert_eq!(
            config.segment_format,
            SegmentFormat::Pcm16 {
                sample_rate: 22_050
            }
        );
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(
            config.backend_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("abc".to_string())
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            load(&[("VOICE_FRAME_MS", "soon")]),
            Err(ConfigError::InvalidValue { name, .. }) if name == "VOICE_FRAME_MS"
        ));
        assert!(matches!(
            load(&[("VOICE_SAMPLE_RATE", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("VOICE_SEGMENT_FORMAT", "mp3")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("RUST_LOG", "loud")]),
            Err(ConfigError::InvalidLogLevel(_))
        ));
        assert!(matches!(
            load(&[("VOICE_GENERATION_URL", " ")]),
            Err(ConfigError::MissingVar(_))
        ));
    }

    #[test]
    fn client_config_carries_urls_and_capture_settings() {
        let config = load(&[
            ("VOICE_GENERATION_URL", "ws://example.test/ws"),
            ("VOICE_FRAME_MS", "40"),
        ])
        .unwrap();
        let client = config.client_config();
        assert_eq!(client.generation.url(), "ws://example.test/ws");
        assert_eq!(client.recognition.url(), DEFAULT_RECOGNITION_URL);
        assert_eq!(client.capture.frame_duration, Duration::from_millis(40));
    }
}
