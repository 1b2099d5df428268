//! End-to-end ingestion and correction flows over the HTTP surface.
//!
//! Drives the real router with the dev-bypass auth header against a
//! throwaway SQLite store. The classifier is disabled so every path is
//! deterministic.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::Engine;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower::util::ServiceExt;

use pennybot_backend::analytics::AnalyticsService;
use pennybot_backend::api::{router, AppState};
use pennybot_backend::auth::JwtVerifier;
use pennybot_backend::categorize::Orchestrator;
use pennybot_backend::config::LlmProvider;
use pennybot_backend::ingest::IngestService;
use pennybot_backend::llm::{LlmClient, LlmConfig};
use pennybot_backend::rules::RuleService;
use pennybot_backend::splits::SplitService;
use pennybot_backend::store::Store;

fn test_state() -> (Router, NamedTempFile) {
    let temp = NamedTempFile::new().unwrap();
    let store = Arc::new(Store::new(temp.path().to_str().unwrap()).unwrap());
    store.audit_indexes().unwrap();

    let llm_config = LlmConfig {
        provider: LlmProvider::VertexLike,
        anthropic_model: "test".into(),
        anthropic_api_key: None,
        vertex_project_id: "test-project".into(),
        vertex_location: "northamerica-northeast1".into(),
        vertex_model: "test".into(),
        vertex_access_token: None,
    };
    let llm = Arc::new(LlmClient::new(reqwest::Client::new(), llm_config));
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), llm.clone(), false));
    let ingest = Arc::new(IngestService::new(
        store.clone(),
        llm.clone(),
        orchestrator.clone(),
        false,
    ));

    let state = AppState {
        rules: Arc::new(RuleService::new(store.clone())),
        splits: Arc::new(SplitService::new(store.clone())),
        analytics: Arc::new(AnalyticsService::new(store.clone())),
        jwt: Arc::new(JwtVerifier::new("test-secret".into())),
        allow_dev_bypass: true,
        store,
        llm,
        orchestrator,
        ingest,
    };
    (router(state), temp)
}

async fn send(app: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-dev-user", "test-user");
    let request = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            builder.body(Body::from(value.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_account(app: &Router) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/accounts",
        Some(json!({ "name": "Chequing", "type": "checking" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    body["data"]["id"].as_str().unwrap().to_string()
}

async fn upload_csv(app: &Router, account_id: &str, csv: &str) -> Value {
    let content = base64::engine::general_purpose::STANDARD.encode(csv);
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/imports/upload",
        Some(json!({
            "accountId": account_id,
            "content": content,
            "filename": "statement.csv",
            "mimeType": "text/csv",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "upload failed: {body}");
    body["data"].clone()
}

const HAPPY_CSV: &str = "date,amount,description\n\
                         2024-01-15,-50.00,COFFEE SHOP #123\n\
                         2024-01-16,100.00,SALARY\n";

#[tokio::test]
async fn healthz_is_public() {
    let (app, _tmp) = test_state();
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_require_auth() {
    let (app, _tmp) = test_state();
    let request = Request::builder()
        .uri("/api/v1/accounts")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn csv_happy_path_then_dedup() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    // First import: two rows land in cents with normalized merchants.
    let outcome = upload_csv(&app, &account_id, HAPPY_CSV).await;
    assert_eq!(outcome["created"], 2);
    assert_eq!(outcome["skipped"], 0);

    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/transactions?month=2024-01",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 2);

    let coffee = items
        .iter()
        .find(|t| t["amount"] == -5000)
        .expect("coffee row");
    assert_eq!(coffee["merchantNormalized"], "COFFEE SHOP");
    let salary = items
        .iter()
        .find(|t| t["amount"] == 10000)
        .expect("salary row");
    assert_eq!(salary["merchantNormalized"], "SALARY");

    // Second import of the same bytes: everything dedupes.
    let outcome = upload_csv(&app, &account_id, HAPPY_CSV).await;
    assert_eq!(outcome["created"], 0);
    assert_eq!(outcome["skipped"], 2);

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["meta"]["pagination"]["total"], 2);
}

#[tokio::test]
async fn rule_match_applies_during_import() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/rules",
        Some(json!({
            "name": "coffee is dining",
            "priority": 700,
            "conditions": { "merchantContains": "STARBUCKS" },
            "action": { "categoryId": "default-dining" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "rule create failed: {body}");

    let csv = "date,amount,description\n2024-01-20,-5.50,SQ *STARBUCKS #12345\n";
    let outcome = upload_csv(&app, &account_id, csv).await;
    assert_eq!(outcome["created"], 1);

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let tx = &body["data"].as_array().unwrap()[0];
    assert_eq!(tx["categoryId"], "default-dining");
    assert_eq!(tx["explainability"]["reason"], "rule_match");
    assert_eq!(tx["explainability"]["matchType"], "contains");
    assert_eq!(tx["explainability"]["confidence"], 0.8);
}

#[tokio::test]
async fn correction_suggestion_accept_loop() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    let csv = "date,amount,description\n\
               2024-01-10,-12.00,CHIPOTLE 0421\n\
               2024-01-11,-14.00,CHIPOTLE 0422\n";
    upload_csv(&app, &account_id, csv).await;

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let items = body["data"].as_array().unwrap().clone();
    let first_id = items[0]["id"].as_str().unwrap().to_string();
    let second_id = items[1]["id"].as_str().unwrap().to_string();

    // First correction comes back with a suggestion.
    let (status, body) = send(
        &app,
        "PATCH",
        &format!("/api/v1/transactions/{first_id}"),
        Some(json!({ "categoryId": "default-dining" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tx = &body["data"]["transaction"];
    assert_eq!(tx["manualOverride"], true);
    assert!(tx["correctedAt"].is_string());
    assert!(tx["autoCategory"].is_object());

    let suggestion = &body["data"]["ruleSuggestion"];
    assert_eq!(suggestion["rule"]["priority"], 300);
    assert_eq!(
        suggestion["rule"]["conditions"]["merchantContains"],
        "CHIPOTLE"
    );
    assert_eq!(suggestion["rule"]["action"]["categoryId"], "default-dining");

    // Accept it; a suggestion-sourced rule appears.
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/rules/suggestions/accept",
        Some(json!({ "rule": suggestion["rule"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["source"], "suggestion");

    // Correcting the sibling no longer suggests: the rule covers it.
    let (status, body) = send(
        &app,
        "PATCH",
        &format!("/api/v1/transactions/{second_id}"),
        Some(json!({ "categoryId": "default-dining" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["ruleSuggestion"].is_null());
}

#[tokio::test]
async fn dismissed_suggestion_not_reoffered() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    let csv = "date,amount,description\n\
               2024-01-10,-12.00,CHIPOTLE 0421\n\
               2024-01-11,-14.00,CHIPOTLE 0422\n";
    upload_csv(&app, &account_id, csv).await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/rules/suggestions/dismiss",
        Some(json!({
            "merchantNormalized": "CHIPOTLE",
            "categoryId": "default-dining",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let id = body["data"][0]["id"].as_str().unwrap().to_string();
    let (_, body) = send(
        &app,
        "PATCH",
        &format!("/api/v1/transactions/{id}"),
        Some(json!({ "categoryId": "default-dining" })),
    )
    .await;
    assert!(body["data"]["ruleSuggestion"].is_null());
}

#[tokio::test]
async fn split_unsplit_round_trip() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    let csv = "date,amount,description\n2024-01-10,-100.00,BIG BOX RUN\n";
    upload_csv(&app, &account_id, csv).await;

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let parent_id = body["data"][0]["id"].as_str().unwrap().to_string();

    // Bad sum rejected up front.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/transactions/{parent_id}/split"),
        Some(json!({ "splits": [ { "amount": -4000 }, { "amount": -3000 } ] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A valid split hides the parent behind its children.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/transactions/{parent_id}/split"),
        Some(json!({ "splits": [
            { "amount": -4000, "categoryId": "default-groceries" },
            { "amount": -3500 },
            { "amount": -2500 },
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|t| t["splitParentId"] == parent_id.as_str()));

    let (_, body) = send(
        &app,
        "GET",
        &format!("/api/v1/transactions/{parent_id}/splits"),
        None,
    )
    .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    // Unsplit restores the parent and reports the deleted count.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/transactions/{parent_id}/unsplit"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deletedChildren"], 3);

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], parent_id.as_str());
    assert_eq!(items[0]["amount"], -10_000);
}

#[tokio::test]
async fn cross_owner_isolation() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;
    upload_csv(&app, &account_id, HAPPY_CSV).await;

    // Another principal sees nothing and cannot read by id.
    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let id = body["data"][0]["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/v1/transactions/{id}"))
        .header("x-dev-user", "someone-else")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn import_record_reaches_completed() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;
    let outcome = upload_csv(&app, &account_id, HAPPY_CSV).await;
    let import_id = outcome["importId"].as_str().unwrap();

    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/v1/imports/{import_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["transactionCount"], 2);
    assert!(body["data"]["completedAt"].is_string());
}

#[tokio::test]
async fn unknown_upload_type_rejected() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    let content = base64::engine::general_purpose::STANDARD.encode("whatever");
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/imports/upload",
        Some(json!({
            "accountId": account_id,
            "content": content,
            "filename": "archive.zip",
            "mimeType": "application/zip",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"]["code"], "UNSUPPORTED_FILE_TYPE");
}

#[tokio::test]
async fn upload_against_foreign_account_is_account_not_found() {
    let (app, _tmp) = test_state();

    let content = base64::engine::general_purpose::STANDARD.encode(HAPPY_CSV);
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/imports/upload",
        Some(json!({
            "accountId": "no-such-account",
            "content": content,
            "filename": "statement.csv",
            "mimeType": "text/csv",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "ACCOUNT_NOT_FOUND");
}

#[tokio::test]
async fn monthly_analytics_over_imported_data() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;
    upload_csv(&app, &account_id, HAPPY_CSV).await;

    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/analytics/monthly?month=2024-01",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let overview = &body["data"];
    assert_eq!(overview["totalIncome"], 10_000);
    assert_eq!(overview["totalExpenses"], -5000);
    assert_eq!(overview["net"], 5000);
    assert_eq!(overview["transactionCount"], 2);
    assert_eq!(overview["daily"].as_array().unwrap().len(), 31);

    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/analytics/trend?month=2024-01",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // December 2023 is empty, so every change is null.
    assert!(body["data"]["incomeChange"].is_null());
    assert!(body["data"]["expensesChange"].is_null());
}

#[tokio::test]
async fn invalid_cursor_is_an_explicit_error() {
    let (app, _tmp) = test_state();
    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/transactions?cursor=garbage!!!",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_PARAMETER");
}

#[tokio::test]
async fn malformed_body_yields_invalid_request_envelope() {
    let (app, _tmp) = test_state();

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/accounts")
        .header("x-dev-user", "test-user")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn wrong_content_type_yields_unsupported_content_type() {
    let (app, _tmp) = test_state();

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/imports/upload")
        .header("x-dev-user", "test-user")
        .header("content-type", "text/plain")
        .body(Body::from("accountId=acc1"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "UNSUPPORTED_CONTENT_TYPE");
}

#[tokio::test]
async fn bad_query_string_yields_invalid_request() {
    let (app, _tmp) = test_state();
    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/transactions?limit=not-a-number",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn unknown_path_answers_in_the_envelope() {
    let (app, _tmp) = test_state();
    let request = Request::builder()
        .uri("/api/v1/no-such-thing")
        .header("x-dev-user", "test-user")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn recategorize_endpoint_applies_new_rules() {
    let (app, _tmp) = test_state();
    let account_id = create_account(&app).await;

    let csv = "date,amount,description\n2024-01-20,-5.50,SQ *STARBUCKS #12345\n";
    upload_csv(&app, &account_id, csv).await;

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    let tx_id = body["data"][0]["id"].as_str().unwrap().to_string();
    assert!(body["data"][0]["categoryId"].is_null());

    // Rule created after the import; the scan applies it retroactively.
    send(
        &app,
        "POST",
        "/api/v1/rules",
        Some(json!({
            "name": "coffee is dining",
            "conditions": { "merchantContains": "STARBUCKS" },
            "action": { "categoryId": "default-dining" },
        })),
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/transactions/recategorize",
        Some(json!({ "transactionIds": [tx_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["updated"], 1);

    let (_, body) = send(&app, "GET", "/api/v1/transactions?month=2024-01", None).await;
    assert_eq!(body["data"][0]["categoryId"], "default-dining");
}
