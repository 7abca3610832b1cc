//! Once-per-key telemetry for cache calls.
//!
//! A call fires telemetry when it carries a hook and its key has not been
//! seen before, or when the key is the zero key. "Seen" is checked against
//! the context's scoped set if [`with_repeated_telemetry`] installed one,
//! otherwise against the session's global set. Keys that fire are always
//! recorded globally as well, so a key reported inside a scope is not
//! reported a second time once it flows back out of it.

use std::sync::Arc;

use tessera_cache::{CacheResult, CallContext, Digest, KeySet};
use tracing::field;

use crate::error::{Error, Result};

/// Completion callback for a telemetered call.
///
/// Invoked exactly once with the final value (if any), whether the engine
/// reported a cache hit, and the error (if any).
pub type TelemetryDone<V> = Box<dyn FnOnce(Option<&V>, bool, Option<&Error>) + Send>;

/// Telemetry hook: decorates the call's context and returns its completion.
pub type TelemetryFunc<V> =
    Arc<dyn Fn(&CallContext) -> (CallContext, TelemetryDone<V>) + Send + Sync>;

/// Reset telemetry dedup for calls made with the returned context.
///
/// Calls under the returned context (and anything derived from it) report
/// keys again even if the session already reported them. Useful when the
/// same work is legitimately repeated and should be seen again, e.g. an
/// agent re-running a tool call.
pub fn with_repeated_telemetry(ctx: &CallContext) -> CallContext {
    ctx.with_seen_keys(KeySet::new())
}

/// Telemetry hook that runs each reported call in an `info` span.
///
/// The span records whether the result came from cache and, on failure, the
/// error.
pub fn span_telemetry<V: 'static>(name: &'static str) -> TelemetryFunc<V> {
    Arc::new(move |ctx: &CallContext| {
        let span = tracing::info_span!(
            parent: ctx.span(),
            "cache_call",
            call = name,
            cached = field::Empty,
            error = field::Empty
        );
        let recorded = span.clone();
        let done: TelemetryDone<V> =
            Box::new(move |_value: Option<&V>, cached: bool, err: Option<&Error>| {
                recorded.record("cached", cached);
                if let Some(err) = err {
                    recorded.record("error", field::display(err));
                }
            });
        (ctx.with_span(span), done)
    })
}

/// Decides which calls fire telemetry.
#[derive(Debug, Default)]
pub(crate) struct TelemetryGate {
    seen: KeySet,
}

impl TelemetryGate {
    /// Mark `key` seen and report whether a call with (`hooked`) or without
    /// a hook should fire telemetry for it.
    ///
    /// Every call marks its key, hooked or not.
    pub(crate) fn observe(&self, ctx: &CallContext, key: Digest, hooked: bool) -> bool {
        let keys = ctx.seen_keys().unwrap_or(&self.seen);
        let seen = keys.check_and_insert(key);
        let fire = hooked && (!seen || key.is_zero());
        if fire {
            self.seen.insert(key);
        }
        fire
    }

    /// The session-wide seen-set.
    pub(crate) fn seen(&self) -> &KeySet {
        &self.seen
    }
}

/// Guarantees a call's completion callback fires exactly once.
///
/// Dropping the guard unfinished (the caller abandoned the call) reports
/// [`Error::Cancelled`].
pub(crate) struct TelemetryGuard<V> {
    done: Option<TelemetryDone<V>>,
}

impl<V> TelemetryGuard<V> {
    pub(crate) fn new(done: TelemetryDone<V>) -> Self {
        Self { done: Some(done) }
    }

    pub(crate) fn finish<H>(mut self, outcome: &Result<H>)
    where
        H: CacheResult<Value = V>,
    {
        let Some(done) = self.done.take() else {
            return;
        };
        match outcome {
            Ok(handle) => done(Some(handle.value()), handle.was_cache_hit(), None),
            Err(err) => done(None, false, Some(err)),
        }
    }
}

impl<V> Drop for TelemetryGuard<V> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done(None, false, Some(&Error::Cancelled));
        }
    }
}
