//! Opaque pagination cursors
//! Mission: Stable keyset paging over (postedAt, id)

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Keyset cursor over the `(postedAt DESC, id DESC)` sort. Encoded as
/// base64 JSON so clients treat it as opaque; stable across equal sort keys
/// because the id participates in the comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCursor {
    pub posted_at: String,
    pub id: String,
}

impl PageCursor {
    pub fn encode(&self) -> String {
        // Serialization of two strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode a client-supplied cursor. Anything that does not round-trip
    /// is an explicit InvalidCursor, never an empty page.
    pub fn decode(raw: &str) -> CoreResult<Self> {
        let bytes = STANDARD
            .decode(raw.trim())
            .map_err(|_| CoreError::InvalidCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| CoreError::InvalidCursor)
    }
}

/// One page of results plus the continuation state. The store fetches
/// `limit + 1` rows and discards the surplus to compute `has_more`.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cur = PageCursor {
            posted_at: "2024-01-15T00:00:00.000000Z".into(),
            id: "tx-123".into(),
        };
        let decoded = PageCursor::decode(&cur.encode()).unwrap();
        assert_eq!(decoded, cur);
    }

    #[test]
    fn garbage_is_invalid_cursor() {
        assert!(matches!(
            PageCursor::decode("not-base64!!"),
            Err(CoreError::InvalidCursor)
        ));
        // Valid base64, invalid payload.
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"{\"nope\":1}");
        assert!(matches!(
            PageCursor::decode(&b64),
            Err(CoreError::InvalidCursor)
        ));
    }
}
