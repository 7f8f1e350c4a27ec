//! Wire-format translation layer - one encode/decode variant per channel kind

pub mod chat_completions;
pub mod extract;
pub mod image_generation;
pub mod native_generate;
pub mod sse;

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::registry::{Channel, ChannelKind};

/// A source image attached to a generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl SourceImage {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    /// `data:<mime>;base64,<payload>` form used by several wire formats.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

/// Logical request to generate an image
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// The prompt to generate an image from
    pub prompt: String,

    /// Ordered source images, possibly empty
    pub images: Vec<SourceImage>,

    /// Explicit channel to use; `None` means any enabled channel
    pub channel: Option<String>,
}

impl GenerateRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Logical result of a successful generation
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    /// Channel that produced the image
    pub channel: String,
}

/// Fully encoded request, ready to be sent over the wire
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    /// Bearer token for the Authorization header, if the format uses one
    pub bearer: Option<String>,
    pub body: serde_json::Value,
    /// Whether the response arrives as an SSE stream
    pub streaming: bool,
}

/// Image payload extracted from a backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Url(String),
    Base64(String),
}

/// Encode a logical request into the wire format of the target channel.
pub fn encode(channel: &Channel, secret: &str, request: &GenerateRequest) -> Result<WireRequest> {
    match channel.kind {
        ChannelKind::ChatCompletions => chat_completions::encode(channel, secret, request),
        ChannelKind::NativeGenerate => native_generate::encode(channel, secret, request),
        ChannelKind::ImageGeneration => image_generation::encode(channel, secret, request),
    }
}

/// Extract the image payload from a decoded response body.
///
/// The kind-specific shape is tried first; proxies routinely answer in a
/// neighboring dialect, so the other extractors run as a fallback. A
/// success-shaped body with no extractable image is a retryable failure.
pub fn decode(channel: &Channel, body: &serde_json::Value) -> Result<ImageRef> {
    try_decode(channel, body)
        .ok_or_else(|| EngineError::retryable(&channel.name, "response contained no image payload"))
}

/// Like [`decode`], but absence of an image is not an error. Used for stream
/// chunks, where most chunks legitimately carry no image yet.
pub fn try_decode(channel: &Channel, body: &serde_json::Value) -> Option<ImageRef> {
    extract_for_kind(channel.kind, body).or_else(|| extract::extract_any(body))
}

fn extract_for_kind(kind: ChannelKind, body: &serde_json::Value) -> Option<ImageRef> {
    match kind {
        ChannelKind::ChatCompletions => chat_completions::extract(body),
        ChannelKind::NativeGenerate => native_generate::extract(body),
        ChannelKind::ImageGeneration => image_generation::extract(body),
    }
}

/// Classify a non-success HTTP status into the engine failure taxonomy.
///
/// Statuses that indicate a problem with the request or credential are
/// non-retryable; everything else (rate limits, server errors, unknown
/// statuses) stays retryable so rotation can absorb it.
pub fn classify_status(channel: &str, status: StatusCode, body: &str) -> EngineError {
    let reason = format!("{}: {}", status, truncate(body, 200));
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => EngineError::non_retryable(channel, reason),
        _ => EngineError::retryable(channel, reason),
    }
}

/// Truncate backend response text for error messages and logs.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{}...[truncated]", head)
    }
}
