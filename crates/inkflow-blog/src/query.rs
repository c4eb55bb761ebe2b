//! Collection query and its cache key.

use crate::cache_keys::KEY_VERSION;

/// Page used when none (or an invalid one) is given.
pub const DEFAULT_PAGE: u32 = 1;

/// Page size used when none (or an invalid one) is given.
pub const DEFAULT_LIMIT: u32 = 16;

/// A normalized collection query.
///
/// Search text is trimmed; the cache key uses its lower-cased form so
/// `"Rust "` and `"rust"` share an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogQuery {
    search: String,
    category: String,
    page: u32,
    limit: u32,
}

impl Default for BlogQuery {
    fn default() -> Self {
        Self::canonical(DEFAULT_PAGE, DEFAULT_LIMIT)
    }
}

impl BlogQuery {
    /// Build a query from raw request values. Pages and limits below 1
    /// fall back to the defaults.
    pub fn new(search: &str, category: &str, page: i64, limit: i64) -> Self {
        Self {
            search: search.trim().to_string(),
            category: category.to_string(),
            page: positive_or(page, DEFAULT_PAGE),
            limit: positive_or(limit, DEFAULT_LIMIT),
        }
    }

    /// Unfiltered query for one page.
    pub fn canonical(page: u32, limit: u32) -> Self {
        Self {
            search: String::new(),
            category: String::new(),
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    /// Trimmed search text, empty for none.
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Category filter, empty for none.
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }

    /// Returns `true` for an unfiltered query.
    pub fn is_canonical(&self) -> bool {
        self.search.is_empty() && self.category.is_empty()
    }

    /// Cache key of this page.
    pub fn cache_key(&self) -> String {
        let search = self.search.to_lowercase();
        format!(
            "blogs:{}:{}:{}:page:{}:limit:{}",
            KEY_VERSION,
            or_all(&search),
            or_all(&self.category),
            self.page,
            self.limit
        )
    }
}

fn positive_or(value: i64, default: u32) -> u32 {
    if value < 1 {
        default
    } else {
        u32::try_from(value).unwrap_or(u32::MAX)
    }
}

fn or_all(value: &str) -> &str {
    if value.is_empty() {
        "all"
    } else {
        value
    }
}
