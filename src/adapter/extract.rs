//! Shared image-payload extraction helpers
//!
//! Backends and proxies return images in a surprising number of shapes:
//! base64 blobs, data URLs, markdown image links, bare URLs inside prose.
//! These helpers normalize all of them into an [`ImageRef`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{chat_completions, image_generation, native_generate, ImageRef};

static MARKDOWN_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("markdown image regex"));

static URL_WITH_IMAGE_EXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s)]+\.(?:png|jpe?g|gif|webp|bmp|ico|tiff?)(?:\?[^\s)]*)?")
        .expect("image url regex")
});

static ANY_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)]+").expect("url regex"));

static DATA_IMAGE_B64: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:image/\w+;base64,([A-Za-z0-9+/=\n]+)").expect("data url regex")
});

/// Page-looking URLs that are almost certainly not image links.
const NON_IMAGE_HINTS: [&str; 5] = ["dashboard", "login", "signin", "register", "admin"];

/// Run every format-specific extractor over a response body.
pub fn extract_any(body: &Value) -> Option<ImageRef> {
    image_generation::extract(body)
        .or_else(|| chat_completions::extract(body))
        .or_else(|| native_generate::extract(body))
}

/// Normalize a URL-shaped string: data URLs become base64 payloads,
/// anything else stays a URL.
pub(crate) fn image_from_url_string(url: &str) -> Option<ImageRef> {
    if url.is_empty() {
        return None;
    }
    if url.starts_with("data:image") {
        return url
            .split_once("base64,")
            .map(|(_, payload)| ImageRef::Base64(payload.to_string()));
    }
    Some(ImageRef::Url(url.to_string()))
}

/// Scrape an image reference out of free-form response text.
///
/// Tried in order of confidence: markdown image link, bare URL with an image
/// extension, any other URL that does not look like a web page, inline data
/// URL.
pub(crate) fn image_from_text(text: &str) -> Option<ImageRef> {
    if let Some(captures) = MARKDOWN_IMAGE.captures(text) {
        return image_from_url_string(captures.get(1)?.as_str());
    }
    if let Some(found) = URL_WITH_IMAGE_EXT.find(text) {
        return Some(ImageRef::Url(found.as_str().to_string()));
    }
    if let Some(found) = ANY_URL.find(text) {
        let url = found.as_str();
        let lowered = url.to_lowercase();
        if !NON_IMAGE_HINTS.iter().any(|hint| lowered.contains(hint)) {
            return Some(ImageRef::Url(url.to_string()));
        }
    }
    if let Some(captures) = DATA_IMAGE_B64.captures(text) {
        return Some(ImageRef::Base64(captures.get(1)?.as_str().to_string()));
    }
    None
}

/// Extract from a `{"url": ...}` / `{"image_url": {"url": ...}}` item as used
/// by OpenAI-style content parts and `message.images` arrays.
pub(crate) fn image_from_part(part: &Value) -> Option<ImageRef> {
    match part.get("type").and_then(Value::as_str) {
        Some("image") => {
            let image = part.get("image")?;
            if let Some(data) = image.get("data").and_then(Value::as_str) {
                if !data.is_empty() {
                    return Some(ImageRef::Base64(data.to_string()));
                }
            }
            image
                .get("url")
                .and_then(Value::as_str)
                .and_then(image_from_url_string)
        }
        Some("image_url") => part
            .get("image_url")?
            .get("url")
            .and_then(Value::as_str)
            .and_then(image_from_url_string),
        Some("text") => part.get("text").and_then(Value::as_str).and_then(image_from_text),
        _ => part
            .get("url")
            .and_then(Value::as_str)
            .and_then(image_from_url_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_link() {
        let result = image_from_text("here you go ![cat](https://cdn.example.com/cat.png)");
        assert_eq!(
            result,
            Some(ImageRef::Url("https://cdn.example.com/cat.png".to_string()))
        );
    }

    #[test]
    fn test_bare_url_with_extension() {
        let result = image_from_text("saved at https://img.example.com/a/b.jpeg?sig=1 enjoy");
        assert_eq!(
            result,
            Some(ImageRef::Url(
                "https://img.example.com/a/b.jpeg?sig=1".to_string()
            ))
        );
    }

    #[test]
    fn test_page_urls_rejected() {
        assert_eq!(
            image_from_text("visit https://example.com/dashboard to see it"),
            None
        );
    }

    #[test]
    fn test_extensionless_url_accepted() {
        let result = image_from_text("https://files.example.com/redirect/xyz");
        assert_eq!(
            result,
            Some(ImageRef::Url(
                "https://files.example.com/redirect/xyz".to_string()
            ))
        );
    }

    #[test]
    fn test_inline_data_url() {
        let result = image_from_text("data:image/png;base64,aGVsbG8=");
        assert_eq!(result, Some(ImageRef::Base64("aGVsbG8=".to_string())));
    }

    #[test]
    fn test_data_url_normalization() {
        assert_eq!(
            image_from_url_string("data:image/png;base64,Zm9v"),
            Some(ImageRef::Base64("Zm9v".to_string()))
        );
        assert_eq!(
            image_from_url_string("https://x/y.png"),
            Some(ImageRef::Url("https://x/y.png".to_string()))
        );
        assert_eq!(image_from_url_string(""), None);
    }
}
