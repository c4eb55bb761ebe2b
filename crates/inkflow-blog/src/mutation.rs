//! Write-side blog changes and the cache keys they invalidate.

use crate::cache_keys;
use crate::model::BlogId;
use inkflow_invalidation::CacheInvalidationPublisher;
use std::sync::Arc;
use tracing::debug;

/// A committed change to the blogs table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlogMutation {
    Created,
    Updated(BlogId),
    Deleted(BlogId),
}

impl BlogMutation {
    /// Cache key patterns made stale by this change.
    ///
    /// Every change invalidates all collection pages; updates and deletes
    /// also invalidate the single-blog entry.
    pub fn key_patterns(&self) -> Vec<String> {
        match self {
            Self::Created => vec![cache_keys::collection_pattern()],
            Self::Updated(id) | Self::Deleted(id) => {
                vec![cache_keys::collection_pattern(), cache_keys::blog_by_id(*id)]
            }
        }
    }
}

/// Publishes invalidations for committed blog changes.
///
/// Call after the database write has committed. Publishing is best effort
/// and never fails the write.
#[derive(Clone)]
pub struct BlogChangeNotifier {
    publisher: Arc<CacheInvalidationPublisher>,
}

impl BlogChangeNotifier {
    pub fn new(publisher: Arc<CacheInvalidationPublisher>) -> Self {
        Self { publisher }
    }

    pub async fn notify(&self, mutation: BlogMutation) {
        debug!(?mutation, "Publishing blog cache invalidation");
        self.publisher.invalidate(mutation.key_patterns()).await;
    }
}
