//! System-of-record port.

use crate::model::{Blog, BlogId, BlogPage};
use crate::query::BlogQuery;
use async_trait::async_trait;
use inkflow_core::{InkflowResult, Interface};

/// Read access to the blogs table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlogStore: Interface + Send + Sync {
    /// One page of blogs matching `query`, newest first, with totals.
    async fn fetch_page(&self, query: &BlogQuery) -> InkflowResult<BlogPage>;

    /// A single blog.
    async fn fetch_blog(&self, id: BlogId) -> InkflowResult<Option<Blog>>;
}
