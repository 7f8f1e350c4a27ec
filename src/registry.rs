//! Channel registry - the set of configured backend targets

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};

/// Wire format spoken by a channel.
///
/// The kind is resolved once at registration time and determines both the
/// request/response schema and which fields are mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// OpenAI-compatible `/chat/completions` endpoint, model supplied in the body
    ChatCompletions,
    /// Gemini-style `:generateContent` endpoint, model embedded in the URL
    NativeGenerate,
    /// `/images/generations` endpoint (Doubao / DALL-E style), model in the body
    ImageGeneration,
}

impl ChannelKind {
    /// Substring the endpoint URL must contain for this kind.
    pub fn url_marker(&self) -> &'static str {
        match self {
            ChannelKind::ChatCompletions => "/chat/completions",
            ChannelKind::NativeGenerate => ":generateContent",
            ChannelKind::ImageGeneration => "/images/generations",
        }
    }

    /// Whether a separately supplied model identifier is mandatory.
    pub fn requires_model(&self) -> bool {
        match self {
            ChannelKind::ChatCompletions | ChannelKind::ImageGeneration => true,
            ChannelKind::NativeGenerate => false,
        }
    }

    /// Guess the kind from an endpoint URL, if it matches exactly one marker.
    pub fn detect(endpoint: &str) -> Option<Self> {
        [
            ChannelKind::ChatCompletions,
            ChannelKind::NativeGenerate,
            ChannelKind::ImageGeneration,
        ]
        .into_iter()
        .find(|kind| endpoint.contains(kind.url_marker()))
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelKind::ChatCompletions => "chat_completions",
            ChannelKind::NativeGenerate => "native_generate",
            ChannelKind::ImageGeneration => "image_generation",
        };
        f.write_str(s)
    }
}

/// A configured backend target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub kind: ChannelKind,
    pub endpoint: String,
    /// Model identifier; mandatory for kinds where `requires_model()` is true
    pub model: Option<String>,
    pub enabled: bool,
    /// Whether requests to this channel use SSE streaming responses
    pub streaming: bool,
}

impl Channel {
    /// Validate endpoint and model against the declared kind.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "channel name cannot be empty".to_string(),
            ));
        }
        if !self.endpoint.contains(self.kind.url_marker()) {
            return Err(EngineError::Validation(format!(
                "endpoint for {} channel '{}' must contain '{}'",
                self.kind,
                self.name,
                self.kind.url_marker()
            )));
        }
        if self.kind.requires_model() && self.model.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(EngineError::Validation(format!(
                "{} channel '{}' requires a model identifier",
                self.kind, self.name
            )));
        }
        if !self.kind.requires_model() && self.model.is_some() {
            return Err(EngineError::Validation(format!(
                "{} channel '{}' embeds the model in the URL; no separate model allowed",
                self.kind, self.name
            )));
        }
        Ok(())
    }
}

/// Registry of configured channels, preserved in insertion order.
///
/// Readers always observe a fully applied channel; every operation takes the
/// registry lock for its whole duration.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<Vec<Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new channel after kind-specific validation.
    pub fn add_channel(&self, channel: Channel) -> Result<()> {
        channel.validate()?;
        let mut channels = self.channels.write();
        if channels.iter().any(|c| c.name == channel.name) {
            return Err(EngineError::ChannelExists(channel.name));
        }
        info!(channel = %channel.name, kind = %channel.kind, "Registered channel");
        channels.push(channel);
        Ok(())
    }

    /// Remove a channel by name.
    ///
    /// In-flight requests that already resolved this channel complete against
    /// their cloned copy; only new lookups start failing.
    pub fn remove_channel(&self, name: &str) -> Result<Channel> {
        let mut channels = self.channels.write();
        let pos = channels
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| EngineError::ChannelNotFound(name.to_string()))?;
        let removed = channels.remove(pos);
        info!(channel = %name, "Removed channel");
        Ok(removed)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.update(name, |c| c.enabled = enabled)
    }

    pub fn set_streaming(&self, name: &str, streaming: bool) -> Result<()> {
        self.update(name, |c| c.streaming = streaming)
    }

    /// Replace the model identifier of an existing channel.
    pub fn update_model(&self, name: &str, model: &str) -> Result<()> {
        if model.trim().is_empty() {
            return Err(EngineError::Validation(
                "model identifier cannot be empty".to_string(),
            ));
        }
        let mut channels = self.channels.write();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| EngineError::ChannelNotFound(name.to_string()))?;
        if !channel.kind.requires_model() {
            return Err(EngineError::Validation(format!(
                "{} channel '{}' embeds the model in the URL",
                channel.kind, name
            )));
        }
        channel.model = Some(model.to_string());
        Ok(())
    }

    /// Look up a channel by name.
    pub fn get(&self, name: &str) -> Option<Channel> {
        self.channels.read().iter().find(|c| c.name == name).cloned()
    }

    /// All channels in insertion order.
    pub fn list(&self) -> Vec<Channel> {
        self.channels.read().clone()
    }

    /// Enabled channels in insertion order.
    pub fn enabled_channels(&self) -> Vec<Channel> {
        self.channels
            .read()
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect()
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut Channel)) -> Result<()> {
        let mut channels = self.channels.write();
        let channel = channels
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| EngineError::ChannelNotFound(name.to_string()))?;
        apply(channel);
        Ok(())
    }
}
