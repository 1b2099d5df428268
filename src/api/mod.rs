//! HTTP surface
//! Mission: Expose the core behind a stable envelope and stable paths

pub mod accounts;
pub mod analytics_api;
pub mod categories;
pub mod envelope;
pub mod extract;
pub mod imports;
pub mod rules_api;
pub mod transactions;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::analytics::AnalyticsService;
use crate::auth::{auth_middleware, JwtVerifier};
use crate::categorize::Orchestrator;
use crate::config::Config;
use crate::ingest::IngestService;
use crate::llm::{LlmClient, LlmConfig};
use crate::rules::RuleService;
use crate::splits::SplitService;
use crate::store::Store;

/// Shared application state, wired once at startup. Tests construct it the
/// same way against a temp store; nothing reaches for globals.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub llm: Arc<LlmClient>,
    pub orchestrator: Arc<Orchestrator>,
    pub ingest: Arc<IngestService>,
    pub rules: Arc<RuleService>,
    pub splits: Arc<SplitService>,
    pub analytics: Arc<AnalyticsService>,
    pub jwt: Arc<JwtVerifier>,
    pub allow_dev_bypass: bool,
}

impl AppState {
    pub fn build(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(Store::new(&config.database_path)?);
        store.audit_indexes()?;

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        let llm = Arc::new(LlmClient::new(http, LlmConfig::from_app_config(config)));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            llm.clone(),
            config.llm_categorization_enabled,
        ));
        let ingest = Arc::new(IngestService::new(
            store.clone(),
            llm.clone(),
            orchestrator.clone(),
            config.llm_categorization_enabled,
        ));

        Ok(Self {
            rules: Arc::new(RuleService::new(store.clone())),
            splits: Arc::new(SplitService::new(store.clone())),
            analytics: Arc::new(AnalyticsService::new(store.clone())),
            jwt: Arc::new(JwtVerifier::new(config.jwt_secret.clone())),
            allow_dev_bypass: config.allow_local_dev_bypass,
            store,
            llm,
            orchestrator,
            ingest,
        })
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Unknown paths answer in the envelope too, not axum's bare 404.
async fn fallback() -> envelope::ApiError {
    envelope::ApiError(crate::error::CoreError::NotFound)
}

/// Assemble the full router: an unauthenticated liveness probe plus the
/// owner-scoped v1 surface.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/v1/transactions",
            get(transactions::list_transactions),
        )
        .route(
            "/api/v1/transactions/recategorize",
            post(transactions::recategorize),
        )
        .route(
            "/api/v1/transactions/:id",
            get(transactions::get_transaction).patch(transactions::patch_transaction),
        )
        .route(
            "/api/v1/transactions/:id/split",
            post(transactions::split_transaction),
        )
        .route(
            "/api/v1/transactions/:id/unsplit",
            post(transactions::unsplit_transaction),
        )
        .route(
            "/api/v1/transactions/:id/splits",
            get(transactions::list_splits),
        )
        .route(
            "/api/v1/accounts",
            get(accounts::list_accounts).post(accounts::create_account),
        )
        .route("/api/v1/categories", get(categories::list_categories))
        .route(
            "/api/v1/rules",
            get(rules_api::list_rules).post(rules_api::create_rule),
        )
        .route("/api/v1/rules/reorder", post(rules_api::reorder_rules))
        .route(
            "/api/v1/rules/suggestions/dismiss",
            post(rules_api::dismiss_suggestion),
        )
        .route(
            "/api/v1/rules/suggestions/accept",
            post(rules_api::accept_suggestion),
        )
        .route(
            "/api/v1/rules/:id",
            axum::routing::patch(rules_api::update_rule).delete(rules_api::delete_rule),
        )
        .route("/api/v1/imports/upload", post(imports::upload))
        .route("/api/v1/imports", get(imports::list_imports))
        .route("/api/v1/imports/:id", get(imports::get_import))
        .route("/api/v1/analytics/monthly", get(analytics_api::monthly))
        .route("/api/v1/analytics/trend", get(analytics_api::trend))
        .route(
            "/api/v1/analytics/categories",
            get(analytics_api::categories),
        )
        .route("/api/v1/analytics/accounts", get(analytics_api::accounts))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), auth_middleware));

    let public = Router::new().route("/healthz", get(healthz));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback(fallback)
        .with_state(state)
}
