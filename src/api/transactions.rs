//! Transaction endpoints
//! Mission: Filtered listing, corrections, splits, and recategorization

use axum::extract::{Extension, Path, State};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::month_range;
use crate::api::envelope::{ok, ok_with_pagination, ApiError, ApiResult, PaginationMeta};
use crate::api::extract::{Json, Query};
use crate::api::AppState;
use crate::auth::AuthContext;
use crate::categorize::RecategorizeOutcome;
use crate::error::CoreError;
use crate::models::{
    validate_notes, validate_tags, AutoCategory, Cents, Explainability, RuleSuggestion,
    Transaction,
};
use crate::splits::SplitInput;
use crate::store::{PageCursor, TransactionFilter};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub month: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub category_id: Option<String>,
    pub account_id: Option<String>,
    pub merchant: Option<String>,
    pub min_amount: Option<Cents>,
    pub max_amount: Option<Cents>,
    /// Comma-separated tag list; a transaction matches when it carries any
    /// of them.
    pub tags: Option<String>,
    pub uncategorized: Option<bool>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

fn parse_day(raw: &str, end_of_day: bool) -> Result<chrono::DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError(CoreError::Validation(format!("bad date: {raw}"))))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time
        .ok_or(ApiError(CoreError::Internal("day bounds".into())))?
        .and_utc())
}

fn build_filter(query: &ListQuery) -> Result<TransactionFilter, ApiError> {
    let mut filter = TransactionFilter {
        category_id: query.category_id.clone(),
        uncategorized: query.uncategorized.unwrap_or(false),
        account_id: query.account_id.clone(),
        ..Default::default()
    };

    if let Some(month) = &query.month {
        let (start, end) = month_range(month)?;
        filter.start = Some(start);
        filter.end = Some(end);
    } else if query.start_date.is_some() || query.end_date.is_some() {
        if let Some(raw) = &query.start_date {
            filter.start = Some(parse_day(raw, false)?);
        }
        if let Some(raw) = &query.end_date {
            filter.end = Some(parse_day(raw, true)?);
        }
    } else {
        // Default window: the current month.
        let current = Utc::now().format("%Y-%m").to_string();
        let (start, end) = month_range(&current)?;
        filter.start = Some(start);
        filter.end = Some(end);
    }
    Ok(filter)
}

/// Filters the source applies after pagination: merchant substring, tag
/// match, amount range. A page can come back shorter than `limit`; the
/// cursor still walks the underlying pages so nothing is skipped.
fn apply_client_filters(query: &ListQuery, items: Vec<Transaction>) -> Vec<Transaction> {
    let merchant_needle = query
        .merchant
        .as_deref()
        .map(str::to_lowercase)
        .filter(|m| !m.is_empty());
    let wanted_tags: Vec<String> = query
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    items
        .into_iter()
        .filter(|tx| {
            if let Some(needle) = &merchant_needle {
                if !tx.merchant_normalized.to_lowercase().contains(needle) {
                    return false;
                }
            }
            if let Some(min) = query.min_amount {
                if tx.amount < min {
                    return false;
                }
            }
            if let Some(max) = query.max_amount {
                if tx.amount > max {
                    return false;
                }
            }
            if !wanted_tags.is_empty() && !wanted_tags.iter().any(|t| tx.tags.contains(t)) {
                return false;
            }
            true
        })
        .collect()
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Transaction>> {
    let filter = build_filter(&query)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let cursor = query
        .cursor
        .as_deref()
        .map(PageCursor::decode)
        .transpose()?;

    let page = state
        .store
        .list_transactions(&auth.owner_id, &filter, cursor.as_ref(), limit)?;
    let total = state.store.count_transactions(&auth.owner_id, &filter)?;

    let pagination = PaginationMeta {
        cursor: page.next_cursor.clone(),
        has_more: page.has_more,
        total: Some(total),
    };
    let items = apply_client_filters(&query, page.items);
    Ok(ok_with_pagination(items, pagination))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Transaction> {
    Ok(ok(state.store.get_transaction(&auth.owner_id, &id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBody {
    pub category_id: Option<String>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResponse {
    pub transaction: Transaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_suggestion: Option<RuleSuggestion>,
}

/// User correction. A category change marks the transaction as manually
/// overridden, preserves the last automatic result, and may come back with
/// a one-shot rule suggestion.
pub async fn patch_transaction(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PatchBody>,
) -> ApiResult<PatchResponse> {
    let mut tx = state.store.get_transaction(&auth.owner_id, &id)?;
    let mut rule_suggestion = None;

    if let Some(notes) = &body.notes {
        validate_notes(notes)?;
        tx.notes = Some(notes.clone());
    }
    if let Some(tags) = &body.tags {
        validate_tags(tags)?;
        tx.tags = tags.clone();
    }

    if let Some(new_category) = &body.category_id {
        if !state.store.category_exists(&auth.owner_id, new_category)? {
            return Err(ApiError(CoreError::Validation(format!(
                "unknown category: {new_category}"
            ))));
        }
        let changed = tx.category_id.as_deref() != Some(new_category.as_str());
        if changed {
            // Keep the last non-manual result on record before overriding.
            if !tx.manual_override {
                tx.auto_category = Some(AutoCategory {
                    category_id: tx.category_id.clone(),
                    explainability: tx.explainability.clone(),
                });
            }
            tx.category_id = Some(new_category.clone());
            tx.manual_override = true;
            tx.corrected_at = Some(Utc::now());
            tx.explainability = Explainability::manual();

            rule_suggestion =
                state
                    .rules
                    .generate_suggestion(&auth.owner_id, &tx, new_category)?;
        }
    }

    tx.updated_at = Utc::now();
    state.store.update_transaction(&auth.owner_id, &tx)?;

    Ok(ok(PatchResponse {
        transaction: tx,
        rule_suggestion,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitBody {
    pub splits: Vec<SplitRequestItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRequestItem {
    pub amount: Cents,
    pub category_id: Option<String>,
    pub notes: Option<String>,
}

pub async fn split_transaction(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<SplitBody>,
) -> ApiResult<Vec<Transaction>> {
    let splits: Vec<SplitInput> = body
        .splits
        .into_iter()
        .map(|s| SplitInput {
            amount: s.amount,
            category_id: s.category_id,
            notes: s.notes,
        })
        .collect();
    Ok(ok(state.splits.split(&auth.owner_id, &id, &splits)?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsplitResponse {
    pub deleted_children: usize,
}

pub async fn unsplit_transaction(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<UnsplitResponse> {
    let deleted_children = state.splits.unsplit(&auth.owner_id, &id)?;
    Ok(ok(UnsplitResponse { deleted_children }))
}

pub async fn list_splits(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Transaction>> {
    Ok(ok(state.splits.children(&auth.owner_id, &id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecategorizeBody {
    pub transaction_ids: Vec<String>,
    #[serde(default)]
    pub include_manual_overrides: bool,
}

/// Batched recategorization scan. Per-row failures accumulate into the
/// error counter and never fail the request.
pub async fn recategorize(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RecategorizeBody>,
) -> ApiResult<RecategorizeOutcome> {
    if body.transaction_ids.is_empty() {
        return Err(ApiError(CoreError::Validation(
            "transactionIds must not be empty".into(),
        )));
    }
    let outcome = state
        .orchestrator
        .recategorize(
            &auth.owner_id,
            &body.transaction_ids,
            body.include_manual_overrides,
        )
        .await?;
    Ok(ok(outcome))
}
