//! Rule endpoints
//! Mission: Rule CRUD plus the suggestion dismiss/accept pair

use axum::extract::{Extension, Path, State};
use serde::{Deserialize, Serialize};

use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::Json;
use crate::api::AppState;
use crate::auth::AuthContext;
use crate::error::CoreError;
use crate::models::{Rule, RuleAction, RuleConditions, SuggestedRule};
use crate::rules::{CreateRuleInput, UpdateRuleInput};

pub async fn list_rules(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Vec<Rule>> {
    Ok(ok(state.store.list_rules(&auth.owner_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleBody {
    pub name: String,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

pub async fn create_rule(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateRuleBody>,
) -> ApiResult<Rule> {
    if body.name.trim().is_empty() {
        return Err(ApiError(CoreError::Validation(
            "rule name must not be empty".into(),
        )));
    }
    let rule = state.rules.create_rule(
        &auth.owner_id,
        CreateRuleInput {
            name: body.name.trim().to_string(),
            enabled: body.enabled,
            priority: body.priority,
            conditions: body.conditions,
            action: body.action,
            source: None,
        },
    )?;
    Ok(ok(rule))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleBody {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub conditions: Option<RuleConditions>,
    pub action: Option<RuleAction>,
}

pub async fn update_rule(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleBody>,
) -> ApiResult<Rule> {
    let rule = state.rules.update_rule(
        &auth.owner_id,
        &id,
        UpdateRuleInput {
            name: body.name,
            enabled: body.enabled,
            priority: body.priority,
            conditions: body.conditions,
            action: body.action,
        },
    )?;
    Ok(ok(rule))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedResponse {
    pub deleted: bool,
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<DeletedResponse> {
    state.rules.delete_rule(&auth.owner_id, &id)?;
    Ok(ok(DeletedResponse { deleted: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderBody {
    pub rule_ids: Vec<String>,
}

pub async fn reorder_rules(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ReorderBody>,
) -> ApiResult<Vec<Rule>> {
    state.rules.reorder(&auth.owner_id, &body.rule_ids)?;
    Ok(ok(state.store.list_rules(&auth.owner_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissBody {
    pub merchant_normalized: String,
    pub category_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissedResponse {
    pub dismissed: bool,
}

pub async fn dismiss_suggestion(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<DismissBody>,
) -> ApiResult<DismissedResponse> {
    if body.merchant_normalized.trim().is_empty() {
        return Err(ApiError(CoreError::Validation(
            "merchantNormalized must not be empty".into(),
        )));
    }
    state.rules.dismiss_suggestion(
        &auth.owner_id,
        body.merchant_normalized.trim(),
        &body.category_id,
    )?;
    Ok(ok(DismissedResponse { dismissed: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBody {
    pub rule: SuggestedRule,
}

/// Materialize an offered suggestion into a persistent rule.
pub async fn accept_suggestion(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<AcceptBody>,
) -> ApiResult<Rule> {
    Ok(ok(state.rules.accept_suggestion(&auth.owner_id, body.rule)?))
}
