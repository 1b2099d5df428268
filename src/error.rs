//! Typed core errors
//! Mission: One error vocabulary from store to HTTP edge

use std::fmt;

/// Errors raised by the core components.
///
/// The HTTP layer maps these onto the stable wire codes; detailed causes
/// stay server-side in logs, never in response messages.
#[derive(Debug)]
pub enum CoreError {
    /// Record absent, or present but owned by someone else. Cross-owner
    /// lookups collapse into this variant so existence never leaks.
    NotFound,
    /// Duplicate txKey, split already applied, and similar state clashes.
    Conflict(String),
    /// Field limits, split sum mismatch, zero-condition rules, bad regex.
    Validation(String),
    /// Auth context missing from the request.
    Unauthorized,
    /// Request body or query string failed to decode at the edge.
    InvalidRequest(String),
    /// Request carried a Content-Type the endpoint does not accept.
    UnsupportedContentType(String),
    /// The referenced account does not belong to the requester.
    AccountNotFound,
    /// Upload exceeds the 10 MiB gate.
    FileTooLarge,
    /// MIME type does not map to a known document kind.
    UnsupportedFileType(String),
    /// Pagination cursor failed to decode.
    InvalidCursor,
    /// Store rejected the operation; retryable.
    StoreUnavailable(String),
    /// A composite index the core depends on is absent; operator action.
    IndexMissing(String),
    /// Classifier unreachable; absorbed by the orchestrator, never surfaced.
    LlmUnavailable(String),
    /// Document yielded zero transactions.
    ParseFailure(String),
    /// Anything else; details logged server-side.
    Internal(String),
}

impl CoreError {
    /// Stable wire code for the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound => "NOT_FOUND",
            CoreError::Conflict(_) => "VALIDATION_ERROR",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Unauthorized => "UNAUTHORIZED",
            CoreError::InvalidRequest(_) => "INVALID_REQUEST",
            CoreError::UnsupportedContentType(_) => "UNSUPPORTED_CONTENT_TYPE",
            CoreError::AccountNotFound => "ACCOUNT_NOT_FOUND",
            CoreError::FileTooLarge => "FILE_TOO_LARGE",
            CoreError::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            CoreError::InvalidCursor => "INVALID_PARAMETER",
            CoreError::StoreUnavailable(_) => "INTERNAL_ERROR",
            CoreError::IndexMissing(_) => "INTERNAL_ERROR",
            CoreError::LlmUnavailable(_) => "INTERNAL_ERROR",
            CoreError::ParseFailure(_) => "IMPORT_FAILED",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a caller may retry the same operation verbatim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable(_) | CoreError::LlmUnavailable(_))
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotFound => write!(f, "not found"),
            CoreError::Conflict(msg) => write!(f, "conflict: {msg}"),
            CoreError::Validation(msg) => write!(f, "validation: {msg}"),
            CoreError::Unauthorized => write!(f, "unauthorized"),
            CoreError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            CoreError::UnsupportedContentType(t) => {
                write!(f, "unsupported content type: {t}")
            }
            CoreError::AccountNotFound => write!(f, "account not found"),
            CoreError::FileTooLarge => write!(f, "file exceeds size limit"),
            CoreError::UnsupportedFileType(t) => write!(f, "unsupported file type: {t}"),
            CoreError::InvalidCursor => write!(f, "invalid pagination cursor"),
            CoreError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            CoreError::IndexMissing(name) => write!(f, "missing index: {name}"),
            CoreError::LlmUnavailable(msg) => write!(f, "llm unavailable: {msg}"),
            CoreError::ParseFailure(msg) => write!(f, "parse failure: {msg}"),
            CoreError::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound,
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CoreError::Conflict(e.to_string())
            }
            _ => CoreError::StoreUnavailable(e.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
