//! Text extraction through Google Cloud Vision.

use super::{ProviderError, ProviderResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_VISION_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Best-effort text extraction from an image.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, image: &[u8], mime_type: &str) -> ProviderResult<String>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageAnnotation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageAnnotation {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug)]
pub struct VisionOcr {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl VisionOcr {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl TextExtractor for VisionOcr {
    async fn extract_text(&self, image: &[u8], _mime_type: &str) -> ProviderResult<String> {
        let body = json!({
            "requests": [{
                "image": { "content": general_purpose::STANDARD.encode(image) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            }]
        });
        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                format!("vision annotate: {text}"),
            ));
        }
        let parsed: AnnotateResponse = response.json().await?;
        parse_annotation(parsed)
    }
}

fn parse_annotation(response: AnnotateResponse) -> ProviderResult<String> {
    let mut text = String::new();
    for annotation in response.responses {
        if let Some(error) = annotation.error.filter(|e| !e.message.is_empty()) {
            return Err(ProviderError::Application(format!(
                "vision API error: {}",
                error.message
            )));
        }
        if let Some(full) = annotation.full_text_annotation {
            text.push_str(&full.text);
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenates_annotations() {
        let raw = r#"{"responses":[{"fullTextAnnotation":{"text":"Invoice 42\n"}},{}]}"#;
        let parsed: AnnotateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_annotation(parsed).unwrap(), "Invoice 42\n");
    }

    #[test]
    fn surfaces_vision_errors() {
        let raw = r#"{"responses":[{"error":{"code":3,"message":"Bad image data."}}]}"#;
        let parsed: AnnotateResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            parse_annotation(parsed),
            Err(ProviderError::Application(msg)) if msg.contains("Bad image data")
        ));
    }
}
