//! Authentication middleware
//! Mission: Gate every protected route behind a verified owner

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::api::envelope::ApiError;
use crate::api::AppState;
use crate::error::CoreError;

/// Authenticated request scope, injected into request extensions. The
/// owner id is opaque and authoritative; the core never looks behind it.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub owner_id: String,
    pub email: Option<String>,
}

/// Validate the bearer token and attach the owner scope. With the local
/// dev bypass enabled (never in production) an `X-Dev-User` header stands
/// in for a token.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx = if state.allow_dev_bypass {
        req.headers()
            .get("x-dev-user")
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.trim().is_empty())
            .map(|dev_user| AuthContext {
                owner_id: dev_user.trim().to_string(),
                email: None,
            })
    } else {
        None
    };

    let ctx = match ctx {
        Some(ctx) => ctx,
        None => {
            let token = req
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .ok_or(ApiError(CoreError::Unauthorized))?;

            let claims = state
                .jwt
                .validate_token(token)
                .map_err(|_| ApiError(CoreError::Unauthorized))?;

            AuthContext {
                owner_id: claims.sub,
                email: claims.email,
            }
        }
    };

    req.extensions_mut().insert(ctx.clone());
    let mut response = next.run(req).await;
    // Echo the scope onto the response so the request logger, which sits
    // outside this layer, can attribute the line to an owner.
    response.extensions_mut().insert(ctx);
    Ok(response)
}
