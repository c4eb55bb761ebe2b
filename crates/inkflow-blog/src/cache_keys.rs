//! Cache key generators for the blog read model.
//!
//! - `blog:<id>` holds a single blog for [`ENTITY_TTL`]
//! - `blogs:<version>:<search>:<category>:page:<n>:limit:<m>` holds a
//!   collection page for [`COLLECTION_TTL`]; see [`BlogQuery::cache_key`]
//!
//! [`BlogQuery::cache_key`]: crate::BlogQuery::cache_key

use crate::model::BlogId;
use std::time::Duration;

/// Version tag of the collection key layout.
pub const KEY_VERSION: &str = "v2";

/// TTL of single-blog entries.
pub const ENTITY_TTL: Duration = Duration::from_secs(3600);

/// TTL of collection pages. Short, so stale pages age out quickly even
/// without an invalidation.
pub const COLLECTION_TTL: Duration = Duration::from_secs(300);

const ENTITY_PREFIX: &str = "blog:";

/// Key of a single blog.
#[must_use]
pub fn blog_by_id(id: BlogId) -> String {
    format!("{}{}", ENTITY_PREFIX, id)
}

/// Pattern covering every collection page.
#[must_use]
pub fn collection_pattern() -> String {
    "blogs:*".to_string()
}

/// Parses the id out of a `blog:<id>` key.
#[must_use]
pub fn parse_blog_id(key: &str) -> Option<BlogId> {
    key.strip_prefix(ENTITY_PREFIX)?.parse().ok()
}
