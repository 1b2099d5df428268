//! Ingestion pipeline
//! Mission: Document in, deduplicated categorized transactions out
//!
//! Parse -> normalize -> dedupe -> categorize -> persist, with the import
//! record advancing pending -> processing -> {completed, failed} around it.

pub mod csv;
pub mod normalize;

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::categorize::Orchestrator;
use crate::error::{CoreError, CoreResult};
use crate::llm::{DocumentPayload, LlmClient, ParsedRow, ParseResult};
use crate::models::{
    AutoCategory, Cents, Explainability, FileKind, Import, ImportStatus, Transaction,
    MAX_UPLOAD_BYTES,
};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct IngestInput {
    pub account_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    /// Explicit kind wins; otherwise derived from the MIME type.
    pub kind: Option<FileKind>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub import_id: String,
    pub created: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Stable dedup key: same account, same posted date, same amount, same
/// description always hash to the same transaction.
pub fn tx_key(account_id: &str, posted_at: chrono::DateTime<Utc>, amount: Cents, description: &str) -> String {
    let date = posted_at.format("%Y-%m-%d");
    let payload = format!("{account_id}|{date}|{amount}|{description}");
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(digest)
}

/// The pipeline holds its collaborators as constructor parameters; the
/// store never learns about the orchestrator above it.
pub struct IngestService {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    orchestrator: Arc<Orchestrator>,
    llm_enabled: bool,
}

impl IngestService {
    pub fn new(
        store: Arc<Store>,
        llm: Arc<LlmClient>,
        orchestrator: Arc<Orchestrator>,
        llm_enabled: bool,
    ) -> Self {
        Self {
            store,
            llm,
            orchestrator,
            llm_enabled,
        }
    }

    fn resolve_kind(&self, input: &IngestInput) -> CoreResult<FileKind> {
        if let Some(kind) = input.kind {
            return Ok(kind);
        }
        let mime = input
            .mime_type
            .as_deref()
            .ok_or_else(|| CoreError::UnsupportedFileType("missing content type".into()))?;
        FileKind::from_mime(mime)
            .ok_or_else(|| CoreError::UnsupportedFileType(mime.to_string()))
    }

    async fn parse(&self, kind: FileKind, input: &IngestInput) -> CoreResult<ParseResult> {
        match kind {
            FileKind::Csv => {
                let text = String::from_utf8_lossy(&input.bytes);
                let rows = csv::parse_statement(&text);
                if !rows.is_empty() {
                    return Ok(ParseResult {
                        transactions: rows,
                        receipt: None,
                    });
                }
                // Deterministic parser came up empty; let the multimodal
                // parser take a shot at the same bytes.
                info!("Deterministic parser yielded zero rows, trying document parser");
                self.llm
                    .parse_document(DocumentPayload {
                        kind,
                        bytes: input.bytes.clone(),
                        mime_type: input.mime_type.clone(),
                    })
                    .await
            }
            FileKind::Pdf | FileKind::Image => {
                self.llm
                    .parse_document(DocumentPayload {
                        kind,
                        bytes: input.bytes.clone(),
                        mime_type: input.mime_type.clone(),
                    })
                    .await
            }
        }
    }

    /// Normalize a merchant with the deterministic pass, the per-owner
    /// cache, and the classifier as a last resort. Classifier failures keep
    /// the deterministic result.
    async fn normalized_merchant(&self, owner: &str, merchant_raw: &str) -> String {
        let deterministic = normalize::normalize_merchant(merchant_raw);
        if normalize::is_confident(&deterministic) {
            return deterministic;
        }

        match self.store.cached_merchant(owner, merchant_raw) {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => warn!("Merchant cache read failed: {e}"),
        }

        if !self.llm_enabled {
            return deterministic;
        }
        match self.llm.normalize_merchant(merchant_raw).await {
            Ok(name) => {
                if let Err(e) = self.store.cache_merchant(owner, merchant_raw, &name) {
                    warn!("Merchant cache write failed: {e}");
                }
                name
            }
            Err(e) => {
                warn!("Secondary merchant normalizer unavailable: {e}");
                deterministic
            }
        }
    }

    pub async fn ingest(&self, owner: &str, input: IngestInput) -> CoreResult<IngestOutcome> {
        // Authorization: the account must belong to the requester.
        let account = self
            .store
            .get_account(owner, &input.account_id)
            .map_err(|_| CoreError::AccountNotFound)?;

        if input.bytes.len() > MAX_UPLOAD_BYTES {
            return Err(CoreError::FileTooLarge);
        }
        let kind = self.resolve_kind(&input)?;

        let now = Utc::now();
        let import = Import {
            id: Uuid::new_v4().to_string(),
            owner_id: owner.to_string(),
            account_id: account.id.clone(),
            filename: input.filename.clone(),
            file_type: kind,
            status: ImportStatus::Pending,
            transaction_count: 0,
            error_message: None,
            created_at: now,
            completed_at: None,
        };
        self.store.create_import(owner, &import)?;
        self.store
            .transition_import(owner, &import.id, ImportStatus::Processing, None, None)?;

        match self.run_pipeline(owner, &account.id, &import.id, kind, &input).await {
            Ok(outcome) => {
                self.store.transition_import(
                    owner,
                    &import.id,
                    ImportStatus::Completed,
                    Some(outcome.created as i64),
                    None,
                )?;
                info!(
                    "📥 Import {} completed: {} created, {} skipped",
                    import.id, outcome.created, outcome.skipped
                );
                Ok(outcome)
            }
            Err(e) => {
                // Terminal failure; already-persisted rows stay valid and
                // dedupe as skipped on retry.
                let _ = self.store.transition_import(
                    owner,
                    &import.id,
                    ImportStatus::Failed,
                    None,
                    Some(&e.to_string()),
                );
                warn!("📥 Import {} failed: {e}", import.id);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        owner: &str,
        account_id: &str,
        import_id: &str,
        kind: FileKind,
        input: &IngestInput,
    ) -> CoreResult<IngestOutcome> {
        // A classifier outage never surfaces as such; from the caller's
        // point of view the document simply failed to parse.
        let parsed = self.parse(kind, input).await.map_err(|e| match e {
            CoreError::LlmUnavailable(msg) => CoreError::ParseFailure(msg),
            other => other,
        })?;
        if parsed.transactions.is_empty() {
            return Err(CoreError::ParseFailure(
                "no transactions extracted from document".into(),
            ));
        }

        let mut skipped = 0usize;
        let mut errors: Vec<String> = Vec::new();
        let mut pending: Vec<Transaction> = Vec::new();

        for row in &parsed.transactions {
            let key = tx_key(account_id, row.posted_at, row.amount, &row.description);
            let already_in_batch = pending.iter().any(|t| t.tx_key == key);
            if already_in_batch || self.store.tx_key_exists(owner, &key)? {
                skipped += 1;
                continue;
            }
            pending.push(self.build_transaction(owner, account_id, import_id, row, key).await);
        }

        // Receipt line items land on the transaction the receipt produced;
        // a receipt image yields one row in practice.
        if let Some(receipt) = &parsed.receipt {
            if let Some(first) = pending.first_mut() {
                first.receipt_line_items = Some(receipt.line_items.clone());
                if let Some(merchant) = &receipt.merchant {
                    first.merchant_normalized = normalize::normalize_merchant(merchant);
                }
            }
        }

        let mut categorizations = self.orchestrator.categorize_batch(owner, &pending).await?;

        let mut created = 0usize;
        for mut tx in pending {
            if let Some(categorization) = categorizations.remove(&tx.id) {
                tx.category_id = categorization.category_id.clone();
                tx.tags = categorization.tags;
                tx.auto_category = Some(AutoCategory {
                    category_id: categorization.category_id,
                    explainability: categorization.explainability.clone(),
                });
                tx.explainability = categorization.explainability;
            }
            match self.store.insert_transaction(owner, &tx) {
                Ok(()) => created += 1,
                Err(CoreError::Conflict(_)) => skipped += 1,
                Err(e) => errors.push(format!("{}: {e}", tx.tx_key)),
            }
        }

        Ok(IngestOutcome {
            import_id: import_id.to_string(),
            created,
            skipped,
            errors,
        })
    }

    async fn build_transaction(
        &self,
        owner: &str,
        account_id: &str,
        import_id: &str,
        row: &ParsedRow,
        key: String,
    ) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4().to_string(),
            owner_id: owner.to_string(),
            account_id: account_id.to_string(),
            import_id: import_id.to_string(),
            posted_at: row.posted_at,
            amount: row.amount,
            description: row.description.clone(),
            merchant_raw: row.merchant_raw.clone(),
            merchant_normalized: self.normalized_merchant(owner, &row.merchant_raw).await,
            category_id: None,
            auto_category: None,
            manual_override: false,
            explainability: Explainability::no_match(),
            notes: None,
            tags: Vec::new(),
            corrected_at: None,
            is_split_parent: false,
            split_parent_id: None,
            receipt_line_items: None,
            tx_key: key,
            created_at: now,
            updated_at: now,
        }
    }
}
