//! Account endpoints

use axum::extract::{Extension, State};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::Json;
use crate::api::AppState;
use crate::auth::AuthContext;
use crate::error::CoreError;
use crate::models::{Account, AccountType};

pub async fn list_accounts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Vec<Account>> {
    Ok(ok(state.store.list_accounts(&auth.owner_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountBody {
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub institution: Option<String>,
    pub last_four: Option<String>,
}

pub async fn create_account(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateAccountBody>,
) -> ApiResult<Account> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError(CoreError::Validation(
            "account name must not be empty".into(),
        )));
    }
    let account_type = AccountType::parse(&body.account_type).ok_or_else(|| {
        ApiError(CoreError::Validation(format!(
            "unknown account type: {}",
            body.account_type
        )))
    })?;

    let now = Utc::now();
    let account = Account {
        id: Uuid::new_v4().to_string(),
        owner_id: auth.owner_id.clone(),
        name: name.to_string(),
        account_type,
        institution: body.institution.filter(|s| !s.trim().is_empty()),
        last_four: body.last_four.filter(|s| !s.trim().is_empty()),
        created_at: now,
        updated_at: now,
    };
    state.store.create_account(&auth.owner_id, &account)?;
    Ok(ok(account))
}
