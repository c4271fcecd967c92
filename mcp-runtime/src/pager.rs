//! Cursor-driven page fetching.
//!
//! The vendor API reports pagination metadata inconsistently across
//! endpoints, so end-of-data is never inferred from its counts. Instead a
//! full page (item count == page size) triggers one speculative fetch of the
//! following page; the probe's contents are discarded and only its emptiness
//! decides whether a successor cursor is minted. A short page is
//! definitionally the last one and skips the probe.

use serde_json::Value;
use thiserror::Error;

use crate::cursor::{self, CursorError, PageCursor};

/// Page size used when a tool is called without a cursor and without an
/// explicit override.
pub const DEFAULT_PAGE_SIZE: u64 = 15;

/// One decoded page from the upstream API. Items are opaque vendor objects;
/// `raw_meta` carries whatever pagination metadata the endpoint returned,
/// untrusted and unused for continuation decisions.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub items: Vec<Value>,
    pub raw_meta: Value,
}

/// A data source that can serve one page of a (possibly scoped) collection.
pub trait PageFetch {
    fn fetch_page(
        &self,
        scope: Option<&str>,
        page_no: u64,
        page_size: u64,
    ) -> impl Future<Output = Result<FetchedPage, PageError>>;
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(#[from] CursorError),
    #[error("cursor was minted for scope '{cursor_scope}' and cannot be redeemed against '{requested_scope}'")]
    ScopeMismatch {
        cursor_scope: String,
        requested_scope: String,
    },
    #[error("upstream page fetch failed: {0}")]
    Upstream(String),
}

/// One page of results plus the token that resumes the sequence, if any.
/// Absence of `next_cursor` is the sole end-of-data signal.
#[derive(Debug)]
pub struct PagedResult {
    pub items: Vec<Value>,
    pub page_no: u64,
    pub page_size: u64,
    pub next_cursor: Option<String>,
    pub raw_meta: Value,
}

/// Fetches the page an optional cursor points at and decides whether a
/// successor cursor exists.
///
/// Cursor decoding and the scope guard run before any network call. A
/// supplied cursor is authoritative for page number and page size; a scoped
/// call rejects any cursor not stamped with exactly its scope. The lookahead
/// probe never fails the overall call — see [`has_successor`].
pub async fn fetch_page_with_lookahead<F: PageFetch>(
    fetcher: &F,
    scope: Option<&str>,
    cursor_token: Option<&str>,
    default_page_size: u64,
) -> Result<PagedResult, PageError> {
    let (page_no, page_size) = match cursor_token {
        None => (1, default_page_size.max(1)),
        Some(token) => {
            let decoded = cursor::decode(token)?;
            if let Some(requested) = scope {
                if decoded.product_key.as_deref() != Some(requested) {
                    return Err(PageError::ScopeMismatch {
                        cursor_scope: decoded
                            .product_key
                            .unwrap_or_else(|| "(unscoped)".to_string()),
                        requested_scope: requested.to_string(),
                    });
                }
            }
            (decoded.page_no, decoded.page_size)
        }
    };

    let page = fetcher.fetch_page(scope, page_no, page_size).await?;

    let next_cursor = if page.items.len() as u64 == page_size {
        if has_successor(fetcher, scope, page_no + 1, page_size).await {
            let successor = PageCursor::new(page_no + 1, page_size, scope.map(str::to_string));
            Some(cursor::encode(&successor))
        } else {
            None
        }
    } else {
        None
    };

    Ok(PagedResult {
        items: page.items,
        page_no,
        page_size,
        next_cursor,
        raw_meta: page.raw_meta,
    })
}

/// Speculative probe: does `page_no` hold at least one item?
///
/// The probe's failure modes collapse into `false` — a broken lookahead must
/// not turn a successful primary fetch into an error, so its absence-of-data
/// answer is best-effort by contract.
pub async fn has_successor<F: PageFetch>(
    fetcher: &F,
    scope: Option<&str>,
    page_no: u64,
    page_size: u64,
) -> bool {
    match fetcher.fetch_page(scope, page_no, page_size).await {
        Ok(page) => !page.items.is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fetcher backed by per-scope item collections. Records every
    /// fetch so tests can assert whether a lookahead happened, and can be
    /// told to fail a specific page number.
    struct FakeFetcher {
        collections: HashMap<Option<String>, Vec<Value>>,
        fail_pages: Vec<u64>,
        calls: Mutex<Vec<(Option<String>, u64, u64)>>,
    }

    impl FakeFetcher {
        fn with_items(count: usize) -> Self {
            let items = (1..=count).map(|n| json!({ "n": n })).collect();
            Self {
                collections: HashMap::from([(None, items)]),
                fail_pages: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_scoped(scopes: &[(&str, usize)]) -> Self {
            let collections = scopes
                .iter()
                .map(|(scope, count)| {
                    let items = (1..=*count)
                        .map(|n| json!({ "scope": scope, "n": n }))
                        .collect();
                    (Some(scope.to_string()), items)
                })
                .collect();
            Self {
                collections,
                fail_pages: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, page_no: u64) -> Self {
            self.fail_pages.push(page_no);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl PageFetch for FakeFetcher {
        async fn fetch_page(
            &self,
            scope: Option<&str>,
            page_no: u64,
            page_size: u64,
        ) -> Result<FetchedPage, PageError> {
            self.calls
                .lock()
                .unwrap()
                .push((scope.map(str::to_string), page_no, page_size));
            if self.fail_pages.contains(&page_no) {
                return Err(PageError::Upstream("simulated network error".to_string()));
            }
            let all = self
                .collections
                .get(&scope.map(str::to_string))
                .ok_or_else(|| PageError::Upstream("unknown scope".to_string()))?;
            let start = ((page_no - 1) * page_size) as usize;
            let end = (start + page_size as usize).min(all.len());
            let items = if start >= all.len() {
                Vec::new()
            } else {
                all[start..end].to_vec()
            };
            Ok(FetchedPage {
                items,
                raw_meta: json!({ "total": all.len() }),
            })
        }
    }

    fn decode_token(token: &str) -> PageCursor {
        cursor::decode(token).expect("successor cursor must decode")
    }

    #[tokio::test]
    async fn full_page_with_nonempty_lookahead_mints_successor() {
        let fetcher = FakeFetcher::with_items(20);
        let result = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap();
        assert_eq!(result.items.len(), 15);
        let next = decode_token(result.next_cursor.as_deref().unwrap());
        assert_eq!(next.page_no, 2);
        assert_eq!(next.page_size, 15);
        assert_eq!(next.product_key, None);
    }

    #[tokio::test]
    async fn full_page_with_empty_lookahead_ends_sequence() {
        let fetcher = FakeFetcher::with_items(15);
        let result = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap();
        assert_eq!(result.items.len(), 15);
        assert!(result.next_cursor.is_none());
        // Primary fetch plus exactly one probe.
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn short_page_skips_lookahead_entirely() {
        let fetcher = FakeFetcher::with_items(7);
        let result = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap();
        assert_eq!(result.items.len(), 7);
        assert!(result.next_cursor.is_none());
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_collection_yields_empty_page_without_cursor() {
        let fetcher = FakeFetcher::with_items(0);
        let result = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap();
        assert!(result.items.is_empty());
        assert!(result.next_cursor.is_none());
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn lookahead_failure_is_swallowed_and_page_still_returned() {
        let fetcher = FakeFetcher::with_items(30).failing_on(2);
        let result = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap();
        assert_eq!(result.items.len(), 15);
        assert!(result.next_cursor.is_none());
    }

    #[tokio::test]
    async fn primary_fetch_failure_propagates() {
        let fetcher = FakeFetcher::with_items(30).failing_on(1);
        let err = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::Upstream(_)));
    }

    #[tokio::test]
    async fn invalid_cursor_fails_before_any_fetch() {
        let fetcher = FakeFetcher::with_items(30);
        let err = fetch_page_with_lookahead(&fetcher, None, Some("garbage!!"), 15)
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::InvalidCursor(_)));
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn scope_mismatch_fails_before_any_fetch() {
        let fetcher = FakeFetcher::with_scoped(&[("P1", 20), ("P2", 5)]);
        let token = cursor::encode(&PageCursor::new(2, 15, Some("P1".to_string())));
        let err = fetch_page_with_lookahead(&fetcher, Some("P2"), Some(&token), 15)
            .await
            .unwrap_err();
        match err {
            PageError::ScopeMismatch {
                cursor_scope,
                requested_scope,
            } => {
                assert_eq!(cursor_scope, "P1");
                assert_eq!(requested_scope, "P2");
            }
            other => panic!("expected scope mismatch, got {other:?}"),
        }
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn scoped_call_rejects_unscoped_cursor() {
        let fetcher = FakeFetcher::with_scoped(&[("P1", 20)]);
        let token = cursor::encode(&PageCursor::new(2, 15, None));
        let err = fetch_page_with_lookahead(&fetcher, Some("P1"), Some(&token), 15)
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::ScopeMismatch { .. }));
    }

    #[tokio::test]
    async fn unscoped_call_ignores_cursor_scope_field() {
        // Collections without a natural parent skip the guard entirely.
        let fetcher = FakeFetcher::with_items(7);
        let token = cursor::encode(&PageCursor::new(1, 15, Some("P1".to_string())));
        let result = fetch_page_with_lookahead(&fetcher, None, Some(&token), 15)
            .await
            .unwrap();
        assert_eq!(result.items.len(), 7);
    }

    #[tokio::test]
    async fn cursor_page_size_overrides_default() {
        let fetcher = FakeFetcher::with_items(30);
        let token = cursor::encode(&PageCursor::new(2, 5, None));
        let result = fetch_page_with_lookahead(&fetcher, None, Some(&token), 15)
            .await
            .unwrap();
        assert_eq!(result.page_size, 5);
        assert_eq!(result.items.len(), 5);
        assert_eq!(result.items[0]["n"], 6);
    }

    #[tokio::test]
    async fn thirty_two_items_paginate_in_three_pages() {
        let fetcher = FakeFetcher::with_items(32);

        let first = fetch_page_with_lookahead(&fetcher, None, None, 15)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 15);
        assert_eq!(first.items[0]["n"], 1);
        assert_eq!(first.items[14]["n"], 15);
        let token = first.next_cursor.expect("first page must have a successor");
        let decoded = decode_token(&token);
        assert_eq!((decoded.page_no, decoded.page_size), (2, 15));

        let second = fetch_page_with_lookahead(&fetcher, None, Some(&token), 15)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 15);
        assert_eq!(second.items[0]["n"], 16);
        assert_eq!(second.items[14]["n"], 30);
        let token = second
            .next_cursor
            .expect("second page must have a successor");
        let decoded = decode_token(&token);
        assert_eq!((decoded.page_no, decoded.page_size), (3, 15));

        let third = fetch_page_with_lookahead(&fetcher, None, Some(&token), 15)
            .await
            .unwrap();
        assert_eq!(third.items.len(), 2);
        assert_eq!(third.items[0]["n"], 31);
        assert_eq!(third.items[1]["n"], 32);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn scoped_pagination_stamps_and_enforces_scope() {
        let fetcher = FakeFetcher::with_scoped(&[("P1", 20), ("P2", 5)]);

        let first = fetch_page_with_lookahead(&fetcher, Some("P1"), None, 15)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 15);
        let token = first.next_cursor.expect("P1 must have a second page");
        assert_eq!(decode_token(&token).product_key.as_deref(), Some("P1"));

        // Replaying P1's cursor against P2 is a caller error.
        let err = fetch_page_with_lookahead(&fetcher, Some("P2"), Some(&token), 15)
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::ScopeMismatch { .. }));

        // Against P1 it resumes cleanly and ends the sequence.
        let second = fetch_page_with_lookahead(&fetcher, Some("P1"), Some(&token), 15)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.items[0]["n"], 16);
        assert_eq!(second.items[4]["n"], 20);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn has_successor_swallows_probe_errors() {
        let fetcher = FakeFetcher::with_items(30).failing_on(2);
        assert!(!has_successor(&fetcher, None, 2, 15).await);
        assert!(has_successor(&fetcher, None, 1, 15).await);
        assert!(!has_successor(&fetcher, None, 3, 15).await);
    }
}
