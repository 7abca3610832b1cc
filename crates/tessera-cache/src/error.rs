//! Error types for cache engine operations.

use std::sync::Arc;

use crate::digest::Digest;

/// Error type for cache engine operations.
///
/// Errors are `Clone` because a single initializer failure is delivered to
/// every caller that was coalesced onto the same key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The initializer for a key failed.
    #[error("Initializer failed: {0:#}")]
    Initializer(Arc<anyhow::Error>),

    /// A post-call callback failed after the value was produced.
    #[error("Post-call callback failed: {0:#}")]
    PostCall(Arc<anyhow::Error>),

    /// Releasing a result failed.
    #[error("Release of {key} failed: {cause:#}")]
    Release {
        /// Key of the result being released.
        key: Digest,
        /// Underlying failure from the release callback.
        cause: Arc<anyhow::Error>,
    },
}

impl Error {
    /// Wrap an initializer failure.
    pub fn initializer(err: anyhow::Error) -> Self {
        Self::Initializer(Arc::new(err))
    }

    /// Wrap a post-call failure.
    pub fn post_call(err: anyhow::Error) -> Self {
        Self::PostCall(Arc::new(err))
    }

    /// Wrap a release failure for `key`.
    pub fn release(key: Digest, err: anyhow::Error) -> Self {
        Self::Release {
            key,
            cause: Arc::new(err),
        }
    }
}

/// Result type for cache engine operations.
pub type Result<T> = std::result::Result<T, Error>;
