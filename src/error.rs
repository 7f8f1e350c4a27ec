//! Common error types for the dispatch engine

use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel already exists: {0}")]
    ChannelExists(String),

    #[error("Credential not found: {channel}#{index}")]
    CredentialNotFound { channel: String, index: usize },

    #[error("No available credential for channel: {0}")]
    NoAvailableCredential(String),

    #[error("Retryable backend failure on {channel}: {reason}")]
    RetryableBackend { channel: String, reason: String },

    #[error("Backend rejected request on {channel}: {reason}")]
    NonRetryableBackend { channel: String, reason: String },

    #[error("All channels exhausted after {attempts} attempts across {channels} channels: {last}")]
    AllChannelsExhausted {
        attempts: usize,
        channels: usize,
        last: String,
    },
}

impl EngineError {
    /// Whether the dispatch loop may continue rotating after this failure.
    ///
    /// Anything that cannot be positively classified as a caller problem is
    /// treated as retryable; credential disablement bounds the cost of
    /// retrying against a persistently bad key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RetryableBackend { .. } | EngineError::NoAvailableCredential(_)
        )
    }

    /// Build a retryable failure for a channel.
    pub fn retryable(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::RetryableBackend {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Build a non-retryable failure for a channel.
    pub fn non_retryable(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::NonRetryableBackend {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::retryable("g", "timeout").is_retryable());
        assert!(EngineError::NoAvailableCredential("g".into()).is_retryable());
        assert!(!EngineError::non_retryable("g", "401 Unauthorized").is_retryable());
        assert!(!EngineError::Validation("empty prompt".into()).is_retryable());
    }
}
