//! Anthropic-style messages provider

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::llm::{LlmConfig, ProviderRequest, LLM_CALL_TIMEOUT};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct ClaudeClient {
    api_key: String,
    model: String,
}

impl ClaudeClient {
    pub fn new(config: &LlmConfig) -> CoreResult<Self> {
        let api_key = config
            .anthropic_api_key
            .clone()
            .ok_or_else(|| CoreError::LlmUnavailable("ANTHROPIC_API_KEY missing".into()))?;
        Ok(Self {
            api_key,
            model: config.anthropic_model.clone(),
        })
    }

    pub async fn generate(
        &self,
        http: &reqwest::Client,
        request: ProviderRequest,
    ) -> CoreResult<String> {
        let mut content = Vec::new();
        if let Some(att) = &request.attachment {
            // Images ride as image blocks, PDFs as document blocks.
            let block_type = if att.mime_type.starts_with("image/") {
                "image"
            } else {
                "document"
            };
            content.push(ContentBlock {
                block_type: block_type.to_string(),
                text: None,
                source: Some(MediaSource {
                    source_type: "base64".to_string(),
                    media_type: att.mime_type.clone(),
                    data: att.base64_data.clone(),
                }),
            });
        }
        content.push(ContentBlock {
            block_type: "text".to_string(),
            text: Some(request.user),
            source: None,
        });

        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system,
            messages: vec![Message {
                role: "user".to_string(),
                content,
            }],
        };

        let resp = http
            .post(MESSAGES_URL)
            .timeout(LLM_CALL_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::LlmUnavailable(format!("messages request: {e}")))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(CoreError::LlmUnavailable(format!(
                "messages {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text)
            .map_err(|e| CoreError::LlmUnavailable(format!("messages json parse: {e}")))?;
        parsed
            .content
            .into_iter()
            .find_map(|b| b.text)
            .ok_or_else(|| CoreError::LlmUnavailable("no text block in reply".into()))
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<MediaSource>,
}

#[derive(Debug, Serialize)]
struct MediaSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
}
