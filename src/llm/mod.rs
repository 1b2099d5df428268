//! LLM adapter
//! Mission: Provider-agnostic classification and document parsing with
//! structured, validated output
//!
//! The classifier never raises into the orchestrator: provider failures
//! come back as `{category: None, confidence: 0, reasoning: <error>}` and
//! confidence is the sole signal upstream.

mod claude;
mod vertex;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{Config, LlmProvider};
use crate::error::{CoreError, CoreResult};
use crate::models::{Cents, FileKind, ReceiptLineItem};

pub use claude::ClaudeClient;
pub use vertex::VertexClient;

/// Max parallel outstanding classify calls in the batch variant.
const MAX_BATCH_CONCURRENCY: usize = 5;
/// Per-call ceiling; an expired call degrades to the rule result upstream.
pub(crate) const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Closed provider configuration surface.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub anthropic_model: String,
    pub anthropic_api_key: Option<String>,
    pub vertex_project_id: String,
    pub vertex_location: String,
    pub vertex_model: String,
    pub vertex_access_token: Option<String>,
}

impl LlmConfig {
    pub fn from_app_config(config: &Config) -> Self {
        Self {
            provider: config.llm_provider,
            anthropic_model: config.anthropic_model.clone(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            vertex_project_id: config.gcp_project_id.clone(),
            vertex_location: config.vertex_location.clone(),
            vertex_model: config.vertex_model.clone(),
            vertex_access_token: std::env::var("VERTEX_ACCESS_TOKEN")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

/// One provider-bound request: a system prompt, a user message, and an
/// optional binary attachment for pdf/image parsing.
pub(crate) struct ProviderRequest {
    pub system: String,
    pub user: String,
    pub attachment: Option<Attachment>,
    pub max_tokens: u32,
}

pub(crate) struct Attachment {
    pub mime_type: String,
    pub base64_data: String,
}

enum ProviderClient {
    Claude(ClaudeClient),
    Vertex(VertexClient),
}

struct ProviderState {
    config: LlmConfig,
    // Lazily built; reset on reconfigure so a provider switch never reuses
    // a stale client.
    client: Option<Arc<ProviderClient>>,
}

/// Process-wide classifier/parsing client. Provider config is read-mostly
/// and guarded for the rare reconfigure.
pub struct LlmClient {
    http: reqwest::Client,
    state: RwLock<ProviderState>,
    batch_sem: Arc<Semaphore>,
}

/// Classification result; `confidence` is the orchestrator's only signal.
#[derive(Debug, Clone)]
pub struct ClassifyOutcome {
    pub category_id: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub model: Option<String>,
}

impl ClassifyOutcome {
    pub fn absent(reasoning: impl Into<String>) -> Self {
        Self {
            category_id: None,
            confidence: 0.0,
            reasoning: reasoning.into(),
            model: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyInput {
    pub description: String,
    pub merchant_raw: String,
    pub amount: Cents,
}

/// A category offered to the classifier; ids are validated on the way back.
#[derive(Debug, Clone)]
pub struct CategoryChoice {
    pub id: String,
    pub name: String,
}

/// A normalized transaction row out of a parsed document.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub posted_at: DateTime<Utc>,
    pub amount: Cents,
    pub description: String,
    pub merchant_raw: String,
}

#[derive(Debug, Clone)]
pub struct ParsedReceipt {
    pub merchant: Option<String>,
    pub line_items: Vec<ReceiptLineItem>,
}

#[derive(Debug, Clone)]
pub struct ParseResult {
    pub transactions: Vec<ParsedRow>,
    /// Present for image documents only.
    pub receipt: Option<ParsedReceipt>,
}

/// Document payload handed to the multimodal parser.
pub struct DocumentPayload {
    pub kind: FileKind,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl LlmClient {
    pub fn new(http: reqwest::Client, config: LlmConfig) -> Self {
        Self {
            http,
            state: RwLock::new(ProviderState {
                config,
                client: None,
            }),
            batch_sem: Arc::new(Semaphore::new(MAX_BATCH_CONCURRENCY)),
        }
    }

    /// Swap provider configuration. Cached clients are dropped so the next
    /// call rebuilds against the new provider.
    pub fn reconfigure(&self, config: LlmConfig) {
        let mut state = self.state.write();
        state.config = config;
        state.client = None;
    }

    pub fn provider(&self) -> LlmProvider {
        self.state.read().config.provider
    }

    fn client(&self) -> CoreResult<Arc<ProviderClient>> {
        if let Some(client) = self.state.read().client.clone() {
            return Ok(client);
        }
        let mut state = self.state.write();
        if let Some(client) = state.client.clone() {
            return Ok(client);
        }
        let built = match state.config.provider {
            LlmProvider::ClaudeLike => {
                ProviderClient::Claude(ClaudeClient::new(&state.config)?)
            }
            LlmProvider::VertexLike => {
                ProviderClient::Vertex(VertexClient::new(&state.config)?)
            }
        };
        let built = Arc::new(built);
        state.client = Some(built.clone());
        Ok(built)
    }

    async fn generate(&self, request: ProviderRequest) -> CoreResult<String> {
        let client = self.client()?;
        match client.as_ref() {
            ProviderClient::Claude(c) => c.generate(&self.http, request).await,
            ProviderClient::Vertex(v) => v.generate(&self.http, request).await,
        }
    }

    fn model_name(&self) -> String {
        let state = self.state.read();
        match state.config.provider {
            LlmProvider::ClaudeLike => state.config.anthropic_model.clone(),
            LlmProvider::VertexLike => state.config.vertex_model.clone(),
        }
    }

    /// Classify one transaction against the offered category set. Absorbs
    /// every provider failure into a zero-confidence outcome.
    pub async fn classify_transaction(
        &self,
        input: &ClassifyInput,
        categories: &[CategoryChoice],
    ) -> ClassifyOutcome {
        let catalog = categories
            .iter()
            .map(|c| format!("- {} ({})", c.id, c.name))
            .collect::<Vec<_>>()
            .join("\n");

        let system = "You are a personal-finance categorization assistant. \
             Respond with a single JSON object: \
             {\"categoryId\": string|null, \"confidence\": number, \"reasoning\": string}. \
             categoryId must be one of the offered ids or null."
            .to_string();
        let user = format!(
            "Transaction:\n  description: {}\n  merchant: {}\n  amount_cents: {}\n\nCategories:\n{}",
            input.description, input.merchant_raw, input.amount, catalog
        );

        let raw = match self
            .generate(ProviderRequest {
                system,
                user,
                attachment: None,
                max_tokens: 512,
            })
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Classifier unavailable, degrading to rules: {e}");
                return ClassifyOutcome::absent(e.to_string());
            }
        };

        match parse_classify_response(&raw, categories) {
            Ok(mut outcome) => {
                outcome.model = Some(self.model_name());
                outcome
            }
            Err(e) => ClassifyOutcome::absent(format!("unparseable classifier output: {e}")),
        }
    }

    /// Bounded-concurrency batch classify: at most five outstanding calls,
    /// one result per input id, individual failures absorbed per entry.
    pub async fn classify_batch(
        &self,
        items: Vec<(String, ClassifyInput)>,
        categories: &[CategoryChoice],
    ) -> HashMap<String, ClassifyOutcome> {
        let futures = items.into_iter().map(|(id, input)| {
            let sem = self.batch_sem.clone();
            async move {
                // The permit must stay alive across the call to bound the
                // number of outstanding requests.
                let outcome = match sem.acquire().await {
                    Ok(_permit) => self.classify_transaction(&input, categories).await,
                    Err(_) => ClassifyOutcome::absent("classifier pool closed"),
                };
                (id, outcome)
            }
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Parse a whole document into transaction rows. Errors here are real:
    /// the pipeline maps an empty/failed parse to an Import failure.
    pub async fn parse_document(&self, payload: DocumentPayload) -> CoreResult<ParseResult> {
        use base64::Engine;

        let wants_receipt = payload.kind == FileKind::Image;
        let system = format!(
            "You extract financial transactions from {} documents. \
             Respond with a single JSON object: \
             {{\"transactions\": [{{\"date\": \"YYYY-MM-DD\", \"amount\": number, \
             \"description\": string, \"merchant\": string}}]{}}}. \
             Amounts are in the account currency, negative for money out.",
            payload.kind.as_str(),
            if wants_receipt {
                ", \"receipt\": {\"merchant\": string, \"lineItems\": [{\"name\": string, \
                 \"quantity\": number, \"unitPrice\": number, \"totalPrice\": number, \
                 \"category\": string|null}]}"
            } else {
                ""
            }
        );

        let (user, attachment) = match payload.kind {
            FileKind::Csv => {
                let text = String::from_utf8_lossy(&payload.bytes).into_owned();
                (format!("Document contents:\n{text}"), None)
            }
            FileKind::Pdf | FileKind::Image => {
                let mime = payload.mime_type.clone().unwrap_or_else(|| {
                    if payload.kind == FileKind::Pdf {
                        "application/pdf".to_string()
                    } else {
                        "image/jpeg".to_string()
                    }
                });
                (
                    "Extract every transaction from the attached document.".to_string(),
                    Some(Attachment {
                        mime_type: mime,
                        base64_data: base64::engine::general_purpose::STANDARD
                            .encode(&payload.bytes),
                    }),
                )
            }
        };

        let raw = self
            .generate(ProviderRequest {
                system,
                user,
                attachment,
                max_tokens: 8192,
            })
            .await
            .map_err(|e| CoreError::LlmUnavailable(e.to_string()))?;

        parse_document_response(&raw)
    }

    /// Secondary merchant normalizer, consulted when the deterministic one
    /// collapses a merchant below three characters.
    pub async fn normalize_merchant(&self, merchant_raw: &str) -> CoreResult<String> {
        let raw = self
            .generate(ProviderRequest {
                system: "Extract the canonical merchant name from a raw bank statement \
                         descriptor. Respond with JSON: {\"merchant\": string}. Uppercase, \
                         no store numbers."
                    .to_string(),
                user: format!("Descriptor: {merchant_raw}"),
                attachment: None,
                max_tokens: 128,
            })
            .await
            .map_err(|e| CoreError::LlmUnavailable(e.to_string()))?;

        #[derive(Deserialize)]
        struct MerchantResponse {
            merchant: String,
        }
        let parsed: MerchantResponse = serde_json::from_str(strip_code_fences(&raw))
            .map_err(|e| CoreError::LlmUnavailable(format!("merchant parse: {e}")))?;
        let name = parsed.merchant.trim().to_uppercase();
        if name.is_empty() {
            return Err(CoreError::LlmUnavailable("empty merchant".into()));
        }
        Ok(name)
    }
}

/// Providers wrap JSON answers in code fences often enough that stripping
/// them is part of the contract.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Confidence outside [0,1] (or non-finite) is coerced to 0.5.
pub fn coerce_confidence(c: f64) -> f64 {
    if !c.is_finite() || !(0.0..=1.0).contains(&c) {
        0.5
    } else {
        c
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyResponse {
    category_id: Option<String>,
    confidence: Option<f64>,
    reasoning: Option<String>,
}

fn parse_classify_response(
    raw: &str,
    categories: &[CategoryChoice],
) -> Result<ClassifyOutcome, serde_json::Error> {
    let parsed: ClassifyResponse = serde_json::from_str(strip_code_fences(raw))?;

    // An id outside the offered set is treated as no answer, not trusted.
    let category_id = parsed.category_id.filter(|id| {
        let known = categories.iter().any(|c| &c.id == id);
        if !known {
            warn!("Classifier returned unknown category id: {id}");
        }
        known
    });

    let confidence = if category_id.is_some() {
        coerce_confidence(parsed.confidence.unwrap_or(0.5))
    } else {
        0.0
    };

    Ok(ClassifyOutcome {
        category_id,
        confidence,
        reasoning: parsed.reasoning.unwrap_or_default(),
        model: None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    #[serde(default)]
    transactions: Vec<DocumentRow>,
    #[serde(default)]
    receipt: Option<DocumentReceipt>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRow {
    date: String,
    amount: f64,
    description: Option<String>,
    merchant: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentReceipt {
    merchant: Option<String>,
    #[serde(default)]
    line_items: Vec<DocumentLineItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentLineItem {
    name: String,
    #[serde(default = "one")]
    quantity: f64,
    #[serde(default)]
    unit_price: f64,
    #[serde(default)]
    total_price: f64,
    category: Option<String>,
}

fn one() -> f64 {
    1.0
}

fn dollars_to_cents(amount: f64) -> Cents {
    (amount * 100.0).round() as Cents
}

fn parse_document_response(raw: &str) -> CoreResult<ParseResult> {
    let parsed: DocumentResponse = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| CoreError::LlmUnavailable(format!("document parse: {e}")))?;

    let mut transactions = Vec::with_capacity(parsed.transactions.len());
    for row in parsed.transactions {
        let Some(date) = NaiveDate::parse_from_str(row.date.trim(), "%Y-%m-%d").ok() else {
            warn!("Dropping parsed row with bad date: {}", row.date);
            continue;
        };
        let amount = dollars_to_cents(row.amount);
        if amount == 0 {
            continue;
        }
        let posted_at = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);
        let description = row.description.unwrap_or_default();
        let merchant_raw = row.merchant.unwrap_or_else(|| description.clone());
        transactions.push(ParsedRow {
            posted_at,
            amount,
            description,
            merchant_raw,
        });
    }

    let receipt = parsed.receipt.map(|r| ParsedReceipt {
        merchant: r.merchant,
        line_items: r
            .line_items
            .into_iter()
            .map(|li| ReceiptLineItem {
                name: li.name,
                quantity: li.quantity,
                unit_price: dollars_to_cents(li.unit_price),
                total_price: dollars_to_cents(li.total_price),
                category: li.category,
            })
            .collect(),
    });

    Ok(ParseResult {
        transactions,
        receipt,
    })
}
