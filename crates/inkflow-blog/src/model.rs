//! Blog domain model and cached view shapes.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Blog identifier.
pub type BlogId = i32;

/// A published blog post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blog {
    pub id: BlogId,
    pub title: String,
    pub description: String,
    /// Body text. Stored in the `blogcontent` column.
    #[serde(rename = "blogcontent")]
    pub content: String,
    pub image: String,
    pub category: String,
    /// Author's user id.
    pub author: String,
    pub create_at: Option<NaiveDateTime>,
}

/// Cached single-blog view (`blog:<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogView {
    pub blog: Blog,
}

/// Pagination metadata of a collection page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total_count: u64,
    pub total_pages: u64,
    pub current_page: u32,
    pub limit: u32,
}

impl Pagination {
    /// Pagination for `total_count` rows split into pages of `limit`.
    pub fn new(total_count: u64, current_page: u32, limit: u32) -> Self {
        let limit = limit.max(1);
        Self {
            total_count,
            total_pages: total_count.div_ceil(u64::from(limit)),
            current_page,
            limit,
        }
    }
}

/// Cached collection view (`blogs:v2:...`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogPage {
    pub blogs: Vec<Blog>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_pages_rounds_up() {
        assert_eq!(Pagination::new(0, 1, 16).total_pages, 0);
        assert_eq!(Pagination::new(16, 1, 16).total_pages, 1);
        assert_eq!(Pagination::new(17, 1, 16).total_pages, 2);
    }

    #[test]
    fn test_page_json_shape() {
        let page = BlogPage {
            blogs: Vec::new(),
            pagination: Pagination::new(33, 2, 16),
        };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "blogs": [],
                "pagination": { "totalCount": 33, "totalPages": 3, "currentPage": 2, "limit": 16 }
            })
        );
    }

    #[test]
    fn test_blog_content_field_name() {
        let blog = Blog {
            id: 1,
            title: "t".into(),
            description: "d".into(),
            content: "body".into(),
            image: "i".into(),
            category: "rust".into(),
            author: "u1".into(),
            create_at: None,
        };
        let json = serde_json::to_value(BlogView { blog }).unwrap();
        assert_eq!(json["blog"]["blogcontent"], "body");
    }
}
