//! Opaque page tokens for list operations.
//!
//! A token is URL-safe base64 over `{"offset":N,"limit":L}`. Stores fetch
//! `limit + 1` rows; the extra row only signals that another page exists.

use crate::defaults::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::error::{ApiError, ApiResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PageToken {
    offset: i64,
    limit: i64,
}

impl PageToken {
    fn encode(&self) -> String {
        // Serializing two integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    fn decode(token: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
        let parsed: PageToken = serde_json::from_slice(&bytes).ok()?;
        if parsed.offset < 0 || parsed.limit <= 0 {
            return None;
        }
        Some(parsed)
    }
}

/// Resolved paging window for a list request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    /// Resolves `page_size` and `page_token` from a request.
    ///
    /// A zero page size means the default; sizes above the cap are clamped.
    pub fn parse(page_size: i32, page_token: &str) -> ApiResult<Self> {
        if page_size < 0 {
            return Err(ApiError::invalid_argument(format!(
                "page size must be non-negative: {}",
                page_size
            )));
        }
        let limit = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => (n as i64).min(MAX_PAGE_SIZE),
        };
        let offset = if page_token.is_empty() {
            0
        } else {
            PageToken::decode(page_token)
                .ok_or_else(|| ApiError::invalid_argument("invalid page token"))?
                .offset
        };
        Ok(Self { limit, offset })
    }

    /// Number of rows to ask the store for.
    pub fn fetch_limit(&self) -> i64 {
        self.limit + 1
    }

    /// Trims the look-ahead row and returns the page plus the next token.
    pub fn finish<T>(&self, mut rows: Vec<T>) -> (Vec<T>, String) {
        if rows.len() as i64 > self.limit {
            rows.truncate(self.limit as usize);
            let next = PageToken {
                offset: self.offset + self.limit,
                limit: self.limit,
            };
            (rows, next.encode())
        } else {
            (rows, String::new())
        }
    }
}
