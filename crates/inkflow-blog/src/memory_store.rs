//! In-memory [`BlogStore`] for local runs and tests.

use crate::model::{Blog, BlogId, BlogPage, Pagination};
use crate::query::BlogQuery;
use crate::store::BlogStore;
use async_trait::async_trait;
use inkflow_core::{InkflowError, InkflowResult};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Blogs held in a vector, queried with the same filter and ordering as
/// the `blogs` table.
#[derive(Default)]
pub struct InMemoryBlogStore {
    blogs: RwLock<Vec<Blog>>,
    reads: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryBlogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a blog.
    pub fn upsert(&self, blog: Blog) {
        let mut blogs = self.blogs.write();
        match blogs.iter_mut().find(|b| b.id == blog.id) {
            Some(existing) => *existing = blog,
            None => blogs.push(blog),
        }
    }

    /// Remove a blog. Returns `true` if it existed.
    pub fn remove(&self, id: BlogId) -> bool {
        let mut blogs = self.blogs.write();
        let before = blogs.len();
        blogs.retain(|b| b.id != id);
        blogs.len() != before
    }

    /// Number of reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make every read fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn begin_read(&self) -> InkflowResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InkflowError::Database("blog store unavailable".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn matches(blog: &Blog, query: &BlogQuery) -> bool {
    let search = query.search().to_lowercase();
    let text_match = search.is_empty()
        || blog.title.to_lowercase().contains(&search)
        || blog.description.to_lowercase().contains(&search);
    let category_match = query.category().is_empty() || blog.category == query.category();
    text_match && category_match
}

#[async_trait]
impl BlogStore for InMemoryBlogStore {
    async fn fetch_page(&self, query: &BlogQuery) -> InkflowResult<BlogPage> {
        self.begin_read()?;

        let mut found: Vec<Blog> = self
            .blogs
            .read()
            .iter()
            .filter(|b| matches(b, query))
            .cloned()
            .collect();
        // Newest first, undated rows last
        found.sort_by_key(|b| Reverse(b.create_at));

        let total = found.len() as u64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let blogs = found
            .into_iter()
            .skip(offset)
            .take(query.limit() as usize)
            .collect();

        Ok(BlogPage {
            blogs,
            pagination: Pagination::new(total, query.page(), query.limit()),
        })
    }

    async fn fetch_blog(&self, id: BlogId) -> InkflowResult<Option<Blog>> {
        self.begin_read()?;
        Ok(self.blogs.read().iter().find(|b| b.id == id).cloned())
    }
}
