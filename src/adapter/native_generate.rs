//! Gemini-style `:generateContent` wire format
//!
//! The model is embedded in the endpoint URL and the credential travels as a
//! `key` query parameter rather than a bearer token.

use serde::Serialize;
use serde_json::Value;

use super::{extract, GenerateRequest, ImageRef, WireRequest};
use crate::error::Result;
use crate::registry::Channel;

#[derive(Serialize)]
struct GeneratePayload {
    contents: Vec<Content>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    Inline {
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

pub fn encode(channel: &Channel, secret: &str, request: &GenerateRequest) -> Result<WireRequest> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let mut parts = vec![Part::Text {
        text: request.prompt.clone(),
    }];
    for image in &request.images {
        parts.push(Part::Inline {
            inline_data: InlineData {
                mime_type: image.mime.clone(),
                data: STANDARD.encode(&image.bytes),
            },
        });
    }

    let payload = GeneratePayload {
        contents: vec![Content { parts }],
    };

    Ok(WireRequest {
        url: format!("{}?key={}", channel.endpoint, secret),
        bearer: None,
        body: serde_json::to_value(payload)?,
        streaming: false,
    })
}

/// Extract the image from a `candidates[].content.parts[]` response.
pub fn extract(body: &Value) -> Option<ImageRef> {
    let parts = body
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;

    for part in parts {
        // Both casings appear in the wild
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
        if let Some(data) = inline
            .and_then(|d| d.get("data"))
            .and_then(Value::as_str)
        {
            return Some(ImageRef::Base64(data.to_string()));
        }
        if let Some(found) = part
            .get("text")
            .and_then(Value::as_str)
            .and_then(extract::image_from_text)
        {
            return Some(found);
        }
    }
    None
}
