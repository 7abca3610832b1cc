//! Per-call context passed to cache operations and initializers.
//!
//! A [`CallContext`] is an immutable value: every decorator returns a new
//! context and leaves the original untouched, so scopes nest naturally.

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::keys::KeySet;

/// Context threaded through a cache call.
///
/// Carries the caller's cancellation signal, the span that work should run
/// under, and an optional telemetry seen-set that shadows the session's
/// global set for this call and everything derived from it.
#[derive(Debug, Clone)]
pub struct CallContext {
    cancellation: CancellationToken,
    span: Span,
    seen_keys: Option<KeySet>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// Create a root context with a fresh cancellation token and no span.
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            span: Span::none(),
            seen_keys: None,
        }
    }

    /// Cancellation token for this call.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the caller has cancelled this call.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Span that work for this call should be instrumented with.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Scoped telemetry seen-set, if one was installed.
    pub fn seen_keys(&self) -> Option<&KeySet> {
        self.seen_keys.as_ref()
    }

    /// Derive a context that uses `cancellation` instead of the current token.
    pub fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    /// Derive a context that is never cancelled by the caller.
    ///
    /// Values (span, seen-set) are kept; only the cancellation link is cut.
    pub fn without_cancel(&self) -> Self {
        self.with_cancellation(CancellationToken::new())
    }

    /// Derive a context that runs work under `span`.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    /// Derive a context with `keys` installed as its telemetry seen-set.
    pub fn with_seen_keys(&self, keys: KeySet) -> Self {
        Self {
            seen_keys: Some(keys),
            ..self.clone()
        }
    }
}
