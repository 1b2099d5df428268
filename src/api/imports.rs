//! Import endpoints
//! Mission: Accept uploaded documents and report import state

use axum::extract::{Extension, Path, State};
use base64::Engine;
use serde::Deserialize;

use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::Json;
use crate::api::AppState;
use crate::auth::AuthContext;
use crate::error::CoreError;
use crate::ingest::{IngestInput, IngestOutcome};
use crate::models::Import;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBody {
    pub account_id: String,
    /// Base64-encoded document bytes.
    pub content: String,
    pub filename: String,
    pub mime_type: String,
}

pub async fn upload(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<UploadBody>,
) -> ApiResult<IngestOutcome> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.content.as_bytes())
        .map_err(|_| ApiError(CoreError::Validation("content is not valid base64".into())))?;

    let outcome = state
        .ingest
        .ingest(
            &auth.owner_id,
            IngestInput {
                account_id: body.account_id,
                filename: body.filename,
                bytes,
                mime_type: Some(body.mime_type),
                kind: None,
            },
        )
        .await?;
    Ok(ok(outcome))
}

pub async fn list_imports(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Vec<Import>> {
    Ok(ok(state.store.list_imports(&auth.owner_id)?))
}

pub async fn get_import(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Import> {
    Ok(ok(state.store.get_import(&auth.owner_id, &id)?))
}
