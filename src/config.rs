//! Engine settings and configuration management

use crate::error::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub first_party: FirstPartyConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Channel that `sk-` prefixed credentials default to when a request does
    /// not pin one explicitly
    #[serde(default)]
    pub compatible_channel: Option<String>,
    /// Where the JSON state store keeps channels, credentials and prompts
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

/// Builtin first-party channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirstPartyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name the builtin channel appears under in pools and listings
    #[serde(default = "default_first_party_name")]
    pub channel: String,
    /// Native-generate endpoint URL (must contain `:generateContent`)
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_first_party_name() -> String {
    "google".to_string()
}

fn default_state_path() -> String {
    "data/state.json".to_string()
}

/// Dispatch loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Timeout covering an entire streamed response
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_ms: u64,
    /// Pacing delay between failed attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_request_timeout() -> u64 {
    120_000
}

fn default_stream_timeout() -> u64 {
    180_000
}

fn default_retry_delay() -> u64 {
    1_000
}

impl Default for FirstPartyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: default_first_party_name(),
            endpoint: None,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            stream_timeout_ms: default_stream_timeout(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            first_party: FirstPartyConfig::default(),
            dispatch: DispatchConfig::default(),
            compatible_channel: None,
            state_path: default_state_path(),
        }
    }
}

impl EngineConfig {
    /// Load settings from the default configuration file and environment.
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/default.toml")
    }

    /// Load settings from a specific configuration file path, with
    /// `IMG_DISPATCH__`-prefixed environment variables taking precedence.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(
                File::with_name(path.as_ref().to_str().unwrap_or("config/default"))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("IMG_DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: EngineConfig = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.first_party.endpoint {
            if !endpoint.contains(":generateContent") {
                return Err(EngineError::Config(config::ConfigError::Message(format!(
                    "first_party.endpoint must contain ':generateContent', got '{}'",
                    endpoint
                ))));
            }
        }
        if self.first_party.channel.trim().is_empty() {
            return Err(EngineError::Config(config::ConfigError::Message(
                "first_party.channel cannot be empty".to_string(),
            )));
        }
        if self.dispatch.request_timeout_ms == 0 || self.dispatch.stream_timeout_ms == 0 {
            return Err(EngineError::Config(config::ConfigError::Message(
                "timeouts must be non-zero".to_string(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.first_party.enabled);
        assert_eq!(config.first_party.channel, "google");
        assert_eq!(config.dispatch.request_timeout_ms, 120_000);
        assert_eq!(config.dispatch.stream_timeout_ms, 180_000);
        assert_eq!(config.dispatch.retry_delay_ms, 1_000);
        assert_eq!(config.state_path, "data/state.json");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_first_party_endpoint() {
        let mut config = EngineConfig::default();
        config.first_party.endpoint =
            Some("https://g.example.com/v1beta/models/x:generateContent".to_string());
        config.validate().unwrap();

        config.first_party.endpoint = Some("https://g.example.com/v1/chat".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = EngineConfig::default();
        config.dispatch.request_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
