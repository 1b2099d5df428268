//! Analytics endpoints
//! Mission: Deterministic monthly read-paths for dashboards

use axum::extract::{Extension, State};
use chrono::Utc;
use serde::Deserialize;

use crate::analytics::{AccountSummary, MonthCategories, MonthlyOverview, SpendingTrend};
use crate::api::envelope::{ok, ApiResult};
use crate::api::extract::Query;
use crate::api::AppState;
use crate::auth::AuthContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthQuery {
    pub month: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthsQuery {
    pub month: Option<String>,
    /// Comma-separated YYYY-MM list.
    pub months: Option<String>,
}

fn month_or_current(month: Option<&str>) -> String {
    month
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().format("%Y-%m").to_string())
}

pub async fn monthly(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<MonthlyOverview> {
    let month = month_or_current(query.month.as_deref());
    Ok(ok(state.analytics.monthly_overview(&auth.owner_id, &month)?))
}

pub async fn trend(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<SpendingTrend> {
    let month = month_or_current(query.month.as_deref());
    Ok(ok(state.analytics.spending_trend(&auth.owner_id, &month)?))
}

pub async fn categories(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<MonthsQuery>,
) -> ApiResult<Vec<MonthCategories>> {
    let months: Vec<String> = match query.months.as_deref() {
        Some(raw) => raw
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect(),
        None => vec![month_or_current(query.month.as_deref())],
    };
    Ok(ok(state
        .analytics
        .categories_over_months(&auth.owner_id, &months)?))
}

pub async fn accounts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<MonthQuery>,
) -> ApiResult<Vec<AccountSummary>> {
    let month = month_or_current(query.month.as_deref());
    Ok(ok(state
        .analytics
        .accounts_overview(&auth.owner_id, &month)?))
}
