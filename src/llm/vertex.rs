//! Vertex-style generateContent provider

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::llm::{LlmConfig, ProviderRequest, LLM_CALL_TIMEOUT};

pub struct VertexClient {
    endpoint: String,
    access_token: String,
}

impl VertexClient {
    pub fn new(config: &LlmConfig) -> CoreResult<Self> {
        let access_token = config
            .vertex_access_token
            .clone()
            .ok_or_else(|| CoreError::LlmUnavailable("VERTEX_ACCESS_TOKEN missing".into()))?;
        let endpoint = format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{proj}/locations/{loc}/publishers/google/models/{model}:generateContent",
            loc = config.vertex_location,
            proj = config.vertex_project_id,
            model = config.vertex_model,
        );
        Ok(Self {
            endpoint,
            access_token,
        })
    }

    pub async fn generate(
        &self,
        http: &reqwest::Client,
        request: ProviderRequest,
    ) -> CoreResult<String> {
        let mut parts = Vec::new();
        if let Some(att) = &request.attachment {
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: att.mime_type.clone(),
                    data: att.base64_data.clone(),
                }),
            });
        }
        parts.push(Part {
            text: Some(request.user),
            inline_data: None,
        });

        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: Some(request.system),
                    inline_data: None,
                }],
            },
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: request.max_tokens,
            },
        };

        let resp = http
            .post(&self.endpoint)
            .timeout(LLM_CALL_TIMEOUT)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::LlmUnavailable(format!("generateContent request: {e}")))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(CoreError::LlmUnavailable(format!(
                "generateContent {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| CoreError::LlmUnavailable(format!("generateContent json parse: {e}")))?;
        parsed
            .candidates
            .into_iter()
            .flat_map(|c| c.content.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| CoreError::LlmUnavailable("no text part in reply".into()))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}
