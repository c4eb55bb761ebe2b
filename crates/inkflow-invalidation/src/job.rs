//! Invalidation job wire format.
//!
//! ```json
//! { "action": "invalidateCache", "keys": ["blogs:*", "blog:42"] }
//! ```

use crate::error::{InvalidationError, InvalidationResult};
use serde::{Deserialize, Serialize};

/// Job action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAction {
    /// Delete every key matching the job's patterns.
    #[serde(rename = "invalidateCache")]
    InvalidateCache,
}

/// A request to invalidate every cache entry matching a set of key patterns.
///
/// Each pattern is a literal key (`blog:42`) or a glob (`blogs:*`). Patterns
/// are processed in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationJob {
    /// Job action.
    pub action: JobAction,
    /// Key patterns, in processing order.
    #[serde(rename = "keys")]
    pub key_patterns: Vec<String>,
}

impl InvalidationJob {
    /// Create an `invalidateCache` job.
    pub fn new<I, S>(key_patterns: I) -> InvalidationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let job = Self {
            action: JobAction::InvalidateCache,
            key_patterns: key_patterns.into_iter().map(Into::into).collect(),
        };
        job.validate()?;
        Ok(job)
    }

    /// Reject empty jobs and blank patterns.
    pub fn validate(&self) -> InvalidationResult<()> {
        if self.key_patterns.is_empty() {
            return Err(InvalidationError::EmptyJob);
        }
        if let Some(blank) = self.key_patterns.iter().find(|p| p.trim().is_empty()) {
            return Err(InvalidationError::InvalidPattern(blank.clone()));
        }
        Ok(())
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> InvalidationResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| InvalidationError::Encode(e.to_string()))
    }

    /// Parse and validate a message body.
    pub fn decode(body: &[u8]) -> InvalidationResult<Self> {
        let job: Self = serde_json::from_slice(body)?;
        job.validate()?;
        Ok(job)
    }
}
