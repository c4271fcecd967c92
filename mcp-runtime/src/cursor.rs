//! Opaque pagination cursors.
//!
//! A cursor encodes the position at which a paginated listing resumes: the
//! next page to fetch, the page size fixed for the sequence, and — for
//! collections nested under a product — the product key the cursor is bound
//! to. The token is JSON behind standard base64: opaque to the caller, not
//! tamper-proof, and stable across encode/decode.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire shape of a pagination cursor. Field names are part of the token
/// contract; unknown fields make a token malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageCursor {
    /// Next page to fetch, 1-based. Never the page just fetched.
    #[serde(rename = "pageNo")]
    pub page_no: u64,
    /// Page size fixed for the lifetime of the pagination sequence.
    #[serde(rename = "pageSize")]
    pub page_size: u64,
    /// Product key the cursor is bound to, when the collection is scoped.
    #[serde(rename = "productKey", default, skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    /// Previously observed total count; carried for forward compatibility,
    /// not consumed anywhere yet.
    #[serde(rename = "totalItems", default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
}

impl PageCursor {
    pub fn new(page_no: u64, page_size: u64, product_key: Option<String>) -> Self {
        Self {
            page_no,
            page_size,
            product_key,
            total_items: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor is not valid base64: {0}")]
    NotBase64(#[from] base64::DecodeError),
    #[error("cursor payload is not a valid page descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("cursor field '{field}' must be a positive integer")]
    OutOfRange { field: &'static str },
}

/// Serializes a cursor to its opaque token. Deterministic: the same cursor
/// value always yields the same token.
pub fn encode(cursor: &PageCursor) -> String {
    let payload = serde_json::to_string(cursor).unwrap_or_else(|_| "{}".to_string());
    BASE64.encode(payload)
}

/// Parses an opaque token back into a cursor. Rejects anything that is not
/// base64 of exactly the [`PageCursor`] wire shape, including `pageNo` or
/// `pageSize` of zero — a bad cursor is surfaced, never coerced to page 1.
pub fn decode(token: &str) -> Result<PageCursor, CursorError> {
    let bytes = BASE64.decode(token.trim())?;
    let cursor: PageCursor = serde_json::from_slice(&bytes)?;
    if cursor.page_no == 0 {
        return Err(CursorError::OutOfRange { field: "pageNo" });
    }
    if cursor.page_size == 0 {
        return Err(CursorError::OutOfRange { field: "pageSize" });
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_unscoped_cursor() {
        let cursor = PageCursor::new(2, 15, None);
        let decoded = decode(&encode(&cursor)).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn encode_decode_round_trips_scoped_cursor_with_total() {
        let cursor = PageCursor {
            page_no: 7,
            page_size: 50,
            product_key: Some("p11aBc".to_string()),
            total_items: Some(512),
        };
        let decoded = decode(&encode(&cursor)).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn encode_is_deterministic() {
        let cursor = PageCursor::new(3, 15, Some("p11aBc".to_string()));
        assert_eq!(encode(&cursor), encode(&cursor));
    }

    #[test]
    fn distinct_cursors_encode_to_distinct_tokens() {
        let a = PageCursor::new(2, 15, None);
        let b = PageCursor::new(3, 15, None);
        let c = PageCursor::new(2, 15, Some("p11aBc".to_string()));
        assert_ne!(encode(&a), encode(&b));
        assert_ne!(encode(&a), encode(&c));
    }

    #[test]
    fn token_omits_absent_optional_fields() {
        let token = encode(&PageCursor::new(2, 15, None));
        let payload = BASE64.decode(token).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["pageNo"], 2);
        assert_eq!(object["pageSize"], 15);
    }

    #[test]
    fn decode_rejects_non_base64_token() {
        assert!(matches!(
            decode("not base64!!"),
            Err(CursorError::NotBase64(_))
        ));
    }

    #[test]
    fn decode_rejects_base64_of_non_json() {
        let token = BASE64.encode("definitely not json");
        assert!(matches!(decode(&token), Err(CursorError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_missing_required_fields() {
        let token = BASE64.encode(r#"{"pageNo": 2}"#);
        assert!(matches!(decode(&token), Err(CursorError::Malformed(_))));

        let token = BASE64.encode(r#"{"pageSize": 15}"#);
        assert!(matches!(decode(&token), Err(CursorError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_unknown_fields() {
        let token = BASE64.encode(r#"{"pageNo": 2, "pageSize": 15, "offset": 30}"#);
        assert!(matches!(decode(&token), Err(CursorError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_wrong_field_types() {
        let token = BASE64.encode(r#"{"pageNo": "2", "pageSize": 15}"#);
        assert!(matches!(decode(&token), Err(CursorError::Malformed(_))));

        let token = BASE64.encode(r#"{"pageNo": -2, "pageSize": 15}"#);
        assert!(matches!(decode(&token), Err(CursorError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_zero_page_number_and_size() {
        let token = BASE64.encode(r#"{"pageNo": 0, "pageSize": 15}"#);
        assert!(matches!(
            decode(&token),
            Err(CursorError::OutOfRange { field: "pageNo" })
        ));

        let token = BASE64.encode(r#"{"pageNo": 1, "pageSize": 0}"#);
        assert!(matches!(
            decode(&token),
            Err(CursorError::OutOfRange { field: "pageSize" })
        ));
    }

    #[test]
    fn decode_tolerates_surrounding_whitespace() {
        let cursor = PageCursor::new(4, 15, None);
        let token = format!("  {}\n", encode(&cursor));
        assert_eq!(decode(&token).unwrap(), cursor);
    }
}
