//! AI document classification through the OpenAI chat completions API.

use super::{ProviderError, ProviderResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// What the classifier decided for one document.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Classification {
    /// Destination bucket name, or a "no destination" value.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Anything else the model returned (summary, dates, amounts...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Classification {
    /// The named destination, or `None` for null, blank or `"None"`.
    pub fn destination(&self) -> Option<&str> {
        self.bucket
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("none"))
    }
}

#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(
        &self,
        image: &[u8],
        mime_type: &str,
        extracted_text: &str,
        candidate_buckets: &[String],
    ) -> ProviderResult<Classification>;
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OpenAiClassifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

fn system_prompt(candidate_buckets: &[String]) -> String {
    format!(
        "You are a document classifier. Choose one of the following categories for the \
         document: {}, or None. Reply with a JSON object of the form \
         {{\"bucket\": <category or null>, \"summary\": <one sentence>}}.",
        candidate_buckets.join(", ")
    )
}

#[async_trait]
impl DocumentClassifier for OpenAiClassifier {
    async fn classify(
        &self,
        image: &[u8],
        mime_type: &str,
        extracted_text: &str,
        candidate_buckets: &[String],
    ) -> ProviderResult<Classification> {
        let data_url = format!(
            "data:{};base64,{}",
            mime_type,
            general_purpose::STANDARD.encode(image)
        );
        let body = json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt(candidate_buckets) },
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": format!("Classify this document. Extracted text:\n{extracted_text}"),
                        },
                        { "type": "image_url", "image_url": { "url": data_url } },
                    ],
                },
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                format!("chat completion: {text}"),
            ));
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Application("classifier returned no content".into()))?;
        parse_classification(&content)
    }
}

/// Parse the model's reply, tolerating a fenced ```json block.
pub fn parse_classification(content: &str) -> ProviderResult<Classification> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(unfenced).map_err(|err| {
        ProviderError::Application(format!("unparseable classification `{unfenced}`: {err}"))
    })
}
