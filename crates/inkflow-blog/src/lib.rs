//! # Inkflow Blog
//!
//! Read side of the blog platform as seen by the cache:
//!
//! - [`cache_keys`] and [`BlogQuery`] define the cache key namespace
//! - [`BlogReadService`] serves reads cache-aside
//! - [`BlogCacheWarmer`] rebuilds canonical views after an invalidation
//! - [`BlogMutation`] maps write-side changes to invalidation patterns
//! - [`BlogStore`] is the system-of-record port, [`PgBlogStore`] its
//!   Postgres adapter and [`InMemoryBlogStore`] a local stand-in

pub mod cache_keys;
mod memory_store;
mod model;
mod mutation;
mod pg_store;
mod query;
mod read_service;
mod store;
mod warmer;

pub use cache_keys::{COLLECTION_TTL, ENTITY_TTL};
pub use memory_store::InMemoryBlogStore;
pub use model::{Blog, BlogId, BlogPage, BlogView, Pagination};
pub use mutation::{BlogChangeNotifier, BlogMutation};
pub use pg_store::PgBlogStore;
pub use query::{BlogQuery, DEFAULT_LIMIT, DEFAULT_PAGE};
pub use read_service::{BlogReadService, Refreshed};
pub use store::BlogStore;
pub use warmer::BlogCacheWarmer;

#[cfg(test)]
pub use store::MockBlogStore;
