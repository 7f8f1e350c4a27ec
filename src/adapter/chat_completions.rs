//! OpenAI-compatible `/chat/completions` wire format

use serde::Serialize;
use serde_json::Value;

use super::{extract, GenerateRequest, ImageRef, WireRequest};
use crate::error::{EngineError, Result};
use crate::registry::Channel;

#[derive(Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlRef },
}

#[derive(Serialize)]
struct ImageUrlRef {
    url: String,
}

pub fn encode(channel: &Channel, secret: &str, request: &GenerateRequest) -> Result<WireRequest> {
    let model = channel.model.as_deref().ok_or_else(|| {
        EngineError::Validation(format!(
            "chat_completions channel '{}' has no model configured",
            channel.name
        ))
    })?;

    let mut content = vec![ContentPart::Text {
        text: request.prompt.clone(),
    }];
    for image in &request.images {
        content.push(ContentPart::ImageUrl {
            image_url: ImageUrlRef {
                url: image.data_url(),
            },
        });
    }

    let payload = ChatPayload {
        model,
        messages: vec![ChatMessage {
            role: "user",
            content,
        }],
        stream: channel.streaming,
    };

    Ok(WireRequest {
        url: channel.endpoint.clone(),
        bearer: Some(secret.to_string()),
        body: serde_json::to_value(payload)?,
        streaming: channel.streaming,
    })
}

/// Extract the image from a chat-completions response or stream chunk.
pub fn extract(body: &Value) -> Option<ImageRef> {
    let choice = body.get("choices")?.as_array()?.first()?;

    // Streaming chunks carry a delta, full responses a message
    let message = choice.get("delta").or_else(|| choice.get("message"))?;

    // Some proxies attach generated images in a dedicated array
    if let Some(images) = message.get("images").and_then(Value::as_array) {
        for item in images {
            if let Some(found) = extract::image_from_part(item) {
                return Some(found);
            }
        }
    }

    match message.get("content") {
        Some(Value::String(text)) => extract::image_from_text(text),
        Some(Value::Array(parts)) => parts.iter().find_map(extract::image_from_part),
        _ => None,
    }
}
