//! Envelope-aware extractors
//! Mission: Malformed input gets the same stable envelope as everything else
//!
//! Axum's built-in extractors answer bad bodies and query strings with
//! their own plain-text rejections. These wrappers route every decode
//! failure through `CoreError` instead, so INVALID_REQUEST and
//! UNSUPPORTED_CONTENT_TYPE come back in the standard response shape.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::request::Parts,
};
use serde::de::DeserializeOwned;

use crate::api::envelope::ApiError;
use crate::error::CoreError;

/// JSON body extractor whose rejections speak the envelope.
pub struct Json<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Json<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Json(value)),
            Err(JsonRejection::MissingJsonContentType(rejection)) => Err(ApiError(
                CoreError::UnsupportedContentType(rejection.to_string()),
            )),
            Err(rejection) => Err(ApiError(CoreError::InvalidRequest(rejection.to_string()))),
        }
    }
}

/// Query-string extractor whose rejections speak the envelope.
pub struct Query<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Query<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match axum::extract::Query::<T>::from_request_parts(parts, state).await {
            Ok(axum::extract::Query(value)) => Ok(Query(value)),
            Err(rejection) => Err(ApiError(CoreError::InvalidRequest(rejection.to_string()))),
        }
    }
}
