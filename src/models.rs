//! Core data model
//! Mission: One typed vocabulary for accounts, imports, transactions and rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// All monetary values are signed integer minor units (cents).
/// Expenses are negative, income positive.
pub type Cents = i64;

pub const MAX_NOTES_LEN: usize = 500;
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_RULES_PER_OWNER: usize = 100;
pub const MAX_REGEX_LEN: usize = 200;
pub const PRIORITY_MIN: i64 = 1;
pub const PRIORITY_MAX: i64 = 1000;
pub const DEFAULT_USER_RULE_PRIORITY: i64 = 500;
pub const DEFAULT_SUGGESTION_RULE_PRIORITY: i64 = 300;
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const MIN_SPLITS: usize = 2;
pub const MAX_SPLITS: usize = 10;

/// Account types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
    Credit,
    Investment,
    Other,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
            AccountType::Credit => "credit",
            AccountType::Investment => "investment",
            AccountType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "checking" => Some(Self::Checking),
            "savings" => Some(Self::Savings),
            "credit" => Some(Self::Credit),
            "investment" => Some(Self::Investment),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_four: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Document kinds the pipeline accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Csv,
    Pdf,
    Image,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Csv => "csv",
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "csv" => Some(Self::Csv),
            "pdf" => Some(Self::Pdf),
            "image" => Some(Self::Image),
            _ => None,
        }
    }

    /// Map a MIME type onto a document kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "text/csv" | "application/csv" | "text/plain" => Some(Self::Csv),
            "application/pdf" => Some(Self::Pdf),
            "image/jpeg" | "image/jpg" | "image/png" | "image/webp" | "image/heic" => {
                Some(Self::Image)
            }
            _ => None,
        }
    }
}

/// Import record state machine: pending -> processing -> {completed, failed}.
/// Terminal states are immutable except for observational fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    /// Legal transitions only; anything else is a Conflict.
    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        matches!(
            (self, next),
            (ImportStatus::Pending, ImportStatus::Processing)
                | (ImportStatus::Processing, ImportStatus::Completed)
                | (ImportStatus::Processing, ImportStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Import {
    pub id: String,
    pub owner_id: String,
    pub account_id: String,
    pub filename: String,
    pub file_type: FileKind,
    pub status: ImportStatus,
    pub transaction_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    /// None for the built-in defaults, which are read-only for everyone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub name: String,
    pub icon: String,
    pub color: String,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub sort_order: i64,
    pub is_hidden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a transaction carries its category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainReason {
    RuleMatch,
    Llm,
    Manual,
    NoMatch,
    Default,
    Split,
}

impl ExplainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExplainReason::RuleMatch => "rule_match",
            ExplainReason::Llm => "llm",
            ExplainReason::Manual => "manual",
            ExplainReason::NoMatch => "no_match",
            ExplainReason::Default => "default",
            ExplainReason::Split => "split",
        }
    }
}

/// Which rule condition produced a textual match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
    Description,
}

impl MatchType {
    /// Default confidence per match shape.
    pub fn confidence(&self) -> f64 {
        match self {
            MatchType::Exact => 1.0,
            MatchType::Contains => 0.8,
            MatchType::Regex => 0.6,
            MatchType::Description => 0.5,
        }
    }
}

/// Audit payload recording why a category was chosen.
/// A transaction always carries exactly one current Explainability; the
/// pre-override one lives inside `auto_category`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explainability {
    pub reason: ExplainReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_reasoning: Option<String>,
}

impl Explainability {
    pub fn no_match() -> Self {
        Self {
            reason: ExplainReason::NoMatch,
            rule_id: None,
            rule_name: None,
            match_type: None,
            matched_value: None,
            matched_pattern: None,
            confidence: 0.0,
            timestamp: Utc::now(),
            llm_model: None,
            llm_reasoning: None,
        }
    }

    pub fn manual() -> Self {
        Self {
            reason: ExplainReason::Manual,
            confidence: 1.0,
            ..Self::no_match()
        }
    }

    pub fn split() -> Self {
        Self {
            reason: ExplainReason::Split,
            confidence: 1.0,
            ..Self::no_match()
        }
    }
}

/// The last non-manual categorization result, preserved across overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCategory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub explainability: Explainability,
}

/// Receipt line item, embedded on image-sourced transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLineItem {
    pub name: String,
    pub quantity: f64,
    pub unit_price: Cents,
    pub total_price: Cents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub owner_id: String,
    pub account_id: String,
    pub import_id: String,
    pub posted_at: DateTime<Utc>,
    pub amount: Cents,
    pub description: String,
    pub merchant_raw: String,
    pub merchant_normalized: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_category: Option<AutoCategory>,
    pub manual_override: bool,
    pub explainability: Explainability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_at: Option<DateTime<Utc>>,
    pub is_split_parent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_line_items: Option<Vec<ReceiptLineItem>>,
    pub tx_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    User,
    Suggestion,
    System,
}

impl RuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSource::User => "user",
            RuleSource::Suggestion => "suggestion",
            RuleSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "suggestion" => Some(Self::Suggestion),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Bag of optional predicates; at least one must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_min: Option<Cents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_max: Option<Cents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_exact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_contains: Option<String>,
}

impl RuleConditions {
    pub fn is_empty(&self) -> bool {
        self.account_id.is_none()
            && self.amount_min.is_none()
            && self.amount_max.is_none()
            && self.merchant_exact.is_none()
            && self.merchant_contains.is_none()
            && self.merchant_regex.is_none()
            && self.description_contains.is_none()
    }

    /// Numeric/account gates never match alone; a rule needs a textual
    /// condition to produce a match.
    pub fn has_textual(&self) -> bool {
        self.merchant_exact.is_some()
            || self.merchant_contains.is_some()
            || self.merchant_regex.is_some()
            || self.description_contains.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    pub category_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub conditions: RuleConditions,
    pub action: RuleAction,
    pub source: RuleSource,
    pub match_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Suppresses regeneration of one (merchant, category) suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissedSuggestion {
    pub id: String,
    pub owner_id: String,
    pub merchant_normalized: String,
    pub category_id: String,
    pub dismissed_at: DateTime<Utc>,
}

/// One-shot rule template generated after a user correction. Not persisted
/// until accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSuggestion {
    pub id: String,
    pub message: String,
    pub rule: SuggestedRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedRule {
    pub name: String,
    pub priority: i64,
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

/// Clamp a requested priority into the legal band.
pub fn clamp_priority(p: i64) -> i64 {
    p.clamp(PRIORITY_MIN, PRIORITY_MAX)
}

/// Field-limit checks shared by PATCH and split payloads.
pub fn validate_notes(notes: &str) -> CoreResult<()> {
    if notes.chars().count() > MAX_NOTES_LEN {
        return Err(CoreError::Validation(format!(
            "notes exceeds {MAX_NOTES_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_tags(tags: &[String]) -> CoreResult<()> {
    if tags.len() > MAX_TAGS {
        return Err(CoreError::Validation(format!(
            "at most {MAX_TAGS} tags allowed"
        )));
    }
    for tag in tags {
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(CoreError::Validation(format!(
                "tag exceeds {MAX_TAG_LEN} characters"
            )));
        }
    }
    Ok(())
}
