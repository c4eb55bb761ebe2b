//! Result type aliases for Inkflow.

use crate::InkflowError;

/// A specialized `Result` type for Inkflow operations.
pub type InkflowResult<T> = Result<T, InkflowError>;

/// A boxed future returning an `InkflowResult`.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = InkflowResult<T>> + Send + 'a>>;
