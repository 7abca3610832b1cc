//! Error types for session cache operations.

use std::fmt;

use tessera_cache::Digest;

/// Error type for session cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Error from the underlying cache engine.
    #[error(transparent)]
    Cache(#[from] tessera_cache::Error),

    /// The session was already closed when the call started.
    #[error("Session cache is closed")]
    Closed,

    /// The session closed while the call was in flight; its result was released.
    #[error("Session cache was closed during execution of {0}")]
    ClosedDuringExecution(Digest),

    /// One or more tracked results failed to release on close.
    #[error("{0}")]
    Release(ReleaseErrors),

    /// The caller dropped the call before it completed.
    #[error("Call was cancelled before completing")]
    Cancelled,
}

/// Release failures collected while closing a session.
#[derive(Debug, Clone, Default)]
pub struct ReleaseErrors(Vec<tessera_cache::Error>);

impl ReleaseErrors {
    /// The individual failures, in release order.
    pub fn errors(&self) -> &[tessera_cache::Error] {
        &self.0
    }

    /// Number of failed releases.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, err: tessera_cache::Error) {
        self.0.push(err);
    }
}

impl fmt::Display for ReleaseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Result type for session cache operations.
pub type Result<T> = std::result::Result<T, Error>;
