//! `/images/generations` wire format (Doubao Seedream / DALL-E style)

use serde::Serialize;
use serde_json::Value;

use super::{extract, GenerateRequest, ImageRef, WireRequest};
use crate::error::{EngineError, Result};
use crate::registry::Channel;

#[derive(Serialize)]
struct ImagesPayload<'a> {
    model: &'a str,
    prompt: &'a str,
    response_format: &'static str,
    size: &'static str,
    stream: bool,
    watermark: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

pub fn encode(channel: &Channel, secret: &str, request: &GenerateRequest) -> Result<WireRequest> {
    let model = channel.model.as_deref().ok_or_else(|| {
        EngineError::Validation(format!(
            "image_generation channel '{}' has no model configured",
            channel.name
        ))
    })?;

    // The backend accepts a single reference image; extra inputs are a
    // caller-side fusion concern.
    let image = request.images.first().map(|img| img.data_url());

    let payload = ImagesPayload {
        model,
        prompt: &request.prompt,
        response_format: "url",
        size: "2k",
        stream: false,
        watermark: false,
        image,
    };

    Ok(WireRequest {
        url: channel.endpoint.clone(),
        bearer: Some(secret.to_string()),
        body: serde_json::to_value(payload)?,
        streaming: false,
    })
}

/// Extract the image from a `{"data": [{"url" | "b64_json": ...}]}` response.
pub fn extract(body: &Value) -> Option<ImageRef> {
    for item in body.get("data")?.as_array()? {
        if let Some(url) = item.get("url").and_then(Value::as_str) {
            if let Some(found) = extract::image_from_url_string(url) {
                return Some(found);
            }
        }
        if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
            if !b64.is_empty() {
                return Some(ImageRef::Base64(b64.to_string()));
            }
        }
    }
    None
}
