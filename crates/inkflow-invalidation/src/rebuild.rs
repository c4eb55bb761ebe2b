//! Cache warm-up after invalidation.

use async_trait::async_trait;
use inkflow_core::{InkflowResult, Interface};

/// Re-populates canonical cache views after a pattern was invalidated.
///
/// Implementations decide which views a pattern covers. A failed rebuild
/// only costs the next reader a cache miss.
#[async_trait]
pub trait CacheRebuilder: Interface + Send + Sync {
    /// Rebuild the views covered by `pattern`. Returns the number of entries
    /// written.
    async fn rebuild(&self, pattern: &str) -> InkflowResult<usize>;
}

/// Deletes only; never rebuilds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRebuilder;

#[async_trait]
impl CacheRebuilder for NoopRebuilder {
    async fn rebuild(&self, _pattern: &str) -> InkflowResult<usize> {
        Ok(0)
    }
}
