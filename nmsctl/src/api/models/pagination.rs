//! Shared pagination types for list endpoints.
//!
//! All list endpoints use offset-based pagination with `skip` and `limit` parameters.

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// Default number of items to return per page.
pub const DEFAULT_LIMIT: i64 = 10;

/// Maximum number of items that can be requested per page.
pub const MAX_LIMIT: i64 = 100;

/// Offset pagination parameters.
///
/// Values are parsed from strings so the struct can be `#[serde(flatten)]`ed into other query
/// types.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    /// Number of items to skip (default: 0)
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub skip: Option<i64>,

    /// Maximum number of items to return (default: 10, max: 100)
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub limit: Option<i64>,
}

impl Pagination {
    #[inline]
    pub fn skip(&self) -> i64 {
        self.skip.unwrap_or(0).max(0)
    }

    /// Clamped to `1..=MAX_LIMIT`.
    #[inline]
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    #[inline]
    pub fn params(&self) -> (i64, i64) {
        (self.skip(), self.limit())
    }
}

/// A page of items plus the total count before pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total_count: i64,
    pub skip: i64,
    pub limit: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total_count: i64, skip: i64, limit: i64) -> Self {
        Self {
            data,
            total_count,
            skip,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_clamping() {
        assert_eq!(Pagination::default().params(), (0, DEFAULT_LIMIT));

        let p = Pagination {
            skip: Some(-5),
            limit: Some(1000),
        };
        assert_eq!(p.params(), (0, MAX_LIMIT));

        let p = Pagination {
            skip: Some(20),
            limit: Some(0),
        };
        assert_eq!(p.params(), (20, 1));
    }

    #[test]
    fn parses_string_values() {
        let p: Pagination = serde_json::from_value(serde_json::json!({"skip": "5", "limit": "25"})).unwrap();
        assert_eq!(p.params(), (5, 25));
    }
}
