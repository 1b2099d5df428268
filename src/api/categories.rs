//! Category endpoints

use axum::extract::{Extension, State};

use crate::api::envelope::{ok, ApiResult};
use crate::api::AppState;
use crate::auth::AuthContext;
use crate::models::Category;

/// Built-in defaults plus the owner's own categories.
pub async fn list_categories(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Vec<Category>> {
    Ok(ok(state.store.list_categories(&auth.owner_id)?))
}
