//! Response envelope
//! Mission: One stable wire shape for every endpoint

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::CoreError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMeta>,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
        meta: None,
    })
}

pub fn ok_with_pagination<T: Serialize>(data: T, pagination: PaginationMeta) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
        meta: Some(Meta {
            pagination: Some(pagination),
        }),
    })
}

/// HTTP-facing error. Wraps a CoreError; the detailed cause is logged
/// server-side and the wire message stays generic.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn invalid_param(detail: impl Into<String>) -> Self {
        ApiError(CoreError::InvalidCursor).with_detail(detail)
    }

    fn with_detail(self, detail: impl Into<String>) -> Self {
        warn!("Invalid request parameter: {}", detail.into());
        self
    }
}

fn wire_shape(e: &CoreError) -> (StatusCode, &'static str, &'static str) {
    match e {
        CoreError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", "Resource not found"),
        CoreError::AccountNotFound => (
            StatusCode::NOT_FOUND,
            "ACCOUNT_NOT_FOUND",
            "Account not found",
        ),
        CoreError::Conflict(_) => (
            StatusCode::CONFLICT,
            "VALIDATION_ERROR",
            "Request conflicts with current state",
        ),
        CoreError::Validation(_) => (
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "Request failed validation",
        ),
        CoreError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Authentication required",
        ),
        CoreError::InvalidRequest(_) => (
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "Request could not be decoded",
        ),
        CoreError::UnsupportedContentType(_) => (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UNSUPPORTED_CONTENT_TYPE",
            "Request content type is not supported",
        ),
        CoreError::FileTooLarge => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "FILE_TOO_LARGE",
            "File exceeds the maximum size",
        ),
        CoreError::UnsupportedFileType(_) => (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UNSUPPORTED_FILE_TYPE",
            "File type is not supported",
        ),
        CoreError::InvalidCursor => (
            StatusCode::BAD_REQUEST,
            "INVALID_PARAMETER",
            "A request parameter is invalid",
        ),
        CoreError::ParseFailure(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "IMPORT_FAILED",
            "Document could not be imported",
        ),
        CoreError::StoreUnavailable(_)
        | CoreError::IndexMissing(_)
        | CoreError::LlmUnavailable(_)
        | CoreError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error",
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = wire_shape(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.to_string(),
                details: None,
            }),
            meta: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_codes() {
        let cases = [
            (CoreError::NotFound, StatusCode::NOT_FOUND),
            (CoreError::AccountNotFound, StatusCode::NOT_FOUND),
            (CoreError::Unauthorized, StatusCode::UNAUTHORIZED),
            (CoreError::FileTooLarge, StatusCode::PAYLOAD_TOO_LARGE),
            (
                CoreError::UnsupportedFileType("zip".into()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (CoreError::InvalidCursor, StatusCode::BAD_REQUEST),
            (
                CoreError::InvalidRequest("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                CoreError::UnsupportedContentType("text/xml".into()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                CoreError::Validation("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (CoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                CoreError::ParseFailure("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                CoreError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[test]
    fn envelope_hides_absent_fields() {
        let json = serde_json::to_string(&Envelope {
            success: true,
            data: Some(42),
            error: None,
            meta: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"success":true,"data":42}"#);
    }
}
