//! Session cache over a coalescing cache engine.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_cache::{
    CacheEngine, CacheResult, CallContext, Digest, Initializer, KeySet, ValueWithCallbacks,
    initializer,
};
use tracing::{debug, error, trace, warn};

use crate::config::{ClosedSessionPolicy, SessionConfig};
use crate::error::{Error, ReleaseErrors, Result};
use crate::options::{CallOpt, CallOpts};
use crate::telemetry::{TelemetryGate, TelemetryGuard};

/// Mutable session state. Guarded by one mutex that is never held across
/// an await.
struct SessionState<H> {
    /// Handles issued this session, in completion order. Zero-key results
    /// are never tracked.
    results: Vec<H>,

    /// Set by [`SessionCache::release_and_close`].
    closed: bool,
}

struct SessionInner<E: CacheEngine> {
    engine: E,
    state: Mutex<SessionState<E::Handle>>,
    telemetry: TelemetryGate,
    config: SessionConfig,
}

/// What to do with a handle once the engine has produced it.
enum Disposition {
    /// Session open: hand it to the caller (tracked unless zero-key).
    Keep,
    /// Call started after close (tolerant mode only).
    StartedClosed,
    /// Session closed while the call was in flight.
    ClosedDuringExecution,
}

/// Session-scoped view of a cache engine.
///
/// This cache provides:
/// - Call coalescing by key, delegated to the engine
/// - Tracking of every handle issued during the session
/// - Release of all tracked handles when the session closes
/// - Once-per-key telemetry, with opt-in repeats per scope
///
/// Handles returned to callers are shared with the session: a caller may
/// release its handle early, but otherwise the session releases it on
/// [`release_and_close`](Self::release_and_close). Either way the reference
/// is released exactly once.
///
/// Calls that observe a closed session are handled per
/// [`ClosedSessionPolicy`].
pub struct SessionCache<E: CacheEngine> {
    inner: Arc<SessionInner<E>>,
}

impl<E: CacheEngine> Clone for SessionCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: CacheEngine> SessionCache<E> {
    /// Create a session over `engine` with default configuration.
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, SessionConfig::default())
    }

    /// Create a session over `engine`.
    pub fn with_config(engine: E, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                engine,
                state: Mutex::new(SessionState {
                    results: Vec::new(),
                    closed: false,
                }),
                telemetry: TelemetryGate::default(),
                config,
            }),
        }
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    /// Whether [`release_and_close`](Self::release_and_close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of handles awaiting release on close.
    pub fn tracked_len(&self) -> usize {
        self.inner.state.lock().results.len()
    }

    /// Keys that have fired telemetry anywhere in this session.
    pub fn seen_keys(&self) -> &KeySet {
        self.inner.telemetry.seen()
    }

    /// Get a handle for `key`, seeding it with an already computed value.
    pub async fn get_or_initialize_value(
        &self,
        ctx: &CallContext,
        key: Digest,
        value: E::Value,
        opts: &[&dyn CallOpt<E::Value>],
    ) -> Result<E::Handle> {
        self.get_or_initialize(ctx, key, move |_ctx| async move { Ok(value) }, opts)
            .await
    }

    /// Get a handle for `key`, running `f` if no shared result exists.
    pub async fn get_or_initialize<F, Fut>(
        &self,
        ctx: &CallContext,
        key: Digest,
        f: F,
        opts: &[&dyn CallOpt<E::Value>],
    ) -> Result<E::Handle>
    where
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<E::Value>> + Send + 'static,
    {
        let init = initializer(move |ctx| async move { f(ctx).await.map(ValueWithCallbacks::new) });
        self.get_or_initialize_with_callbacks(ctx, key, false, init, opts)
            .await
    }

    /// Get a handle for `key`, running `init` if no shared result exists.
    ///
    /// With `skip_dedupe`, `init` always runs and its result is not shared
    /// with other callers; the handle is still tracked by the session.
    pub async fn get_or_initialize_with_callbacks(
        &self,
        ctx: &CallContext,
        key: Digest,
        skip_dedupe: bool,
        init: Initializer<E::Value>,
        opts: &[&dyn CallOpt<E::Value>],
    ) -> Result<E::Handle> {
        let started_closed = self.is_closed();
        if started_closed {
            match self.inner.config.closed_policy {
                ClosedSessionPolicy::Strict => {
                    warn!(key = %key, "Rejected call on closed session cache");
                    return Err(Error::Closed);
                }
                ClosedSessionPolicy::Tolerant => {
                    error!(key = %key, "Session cache is already closed");
                }
            }
        }

        let opts = CallOpts::from_opts(opts);
        let mut ctx = ctx.clone();
        let mut telemetry = None;
        let fire = self
            .inner
            .telemetry
            .observe(&ctx, key, opts.telemetry.is_some());
        if let Some(hook) = opts.telemetry.as_ref().filter(|_| fire) {
            let (telemetry_ctx, done) = hook(&ctx);
            ctx = telemetry_ctx;
            telemetry = Some(TelemetryGuard::new(done));
        }

        let outcome = self
            .call(&ctx, key, skip_dedupe, init, started_closed)
            .await;

        if let Some(guard) = telemetry {
            guard.finish(&outcome);
        }
        outcome
    }

    async fn call(
        &self,
        ctx: &CallContext,
        key: Digest,
        skip_dedupe: bool,
        init: Initializer<E::Value>,
        started_closed: bool,
    ) -> Result<E::Handle> {
        let handle = self
            .inner
            .engine
            .get_or_initialize_with_callbacks(ctx, key, skip_dedupe, init)
            .await?;

        // Re-check under the lock: the session may have closed while the
        // engine was running the call.
        let disposition = {
            let mut state = self.inner.state.lock();
            if started_closed {
                Disposition::StartedClosed
            } else if state.closed {
                Disposition::ClosedDuringExecution
            } else {
                if !key.is_zero() {
                    state.results.push(handle.clone());
                }
                Disposition::Keep
            }
        };

        match disposition {
            Disposition::Keep => {
                trace!(key = %key, hit = handle.was_cache_hit(), "Issued session result");
                Ok(handle)
            }
            Disposition::StartedClosed => {
                self.force_release(ctx, &handle).await?;
                Ok(handle)
            }
            Disposition::ClosedDuringExecution => match self.inner.config.closed_policy {
                ClosedSessionPolicy::Strict => {
                    warn!(key = %key, "Session cache was closed during execution");
                    self.force_release(ctx, &handle).await?;
                    Err(Error::ClosedDuringExecution(key))
                }
                ClosedSessionPolicy::Tolerant => {
                    error!(key = %key, "Session cache was closed during execution");
                    self.force_release(ctx, &handle).await?;
                    Ok(handle)
                }
            },
        }
    }

    /// Release a handle the session will not track, immune to the caller's
    /// cancellation.
    async fn force_release(&self, ctx: &CallContext, handle: &E::Handle) -> Result<()> {
        debug!(key = %handle.key(), "Releasing result issued after session close");
        handle.release(&ctx.without_cancel()).await?;
        Ok(())
    }

    /// Close the session and release every tracked handle.
    ///
    /// Release failures do not stop the remaining releases; they are joined
    /// into a single [`Error::Release`]. Calls still in flight are not
    /// waited on: they observe the closed flag when they finish and release
    /// their own handles.
    ///
    /// Calling this again is harmless. Only the call that closed the session
    /// releases anything and sees release failures; any other call returns
    /// `Ok(())` at once, possibly before the first has finished releasing.
    pub async fn release_and_close(&self, ctx: &CallContext) -> Result<()> {
        let results = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.results)
        };

        debug!(count = results.len(), "Closing session cache");

        let mut failures = ReleaseErrors::default();
        for result in results {
            if let Err(err) = result.release(ctx).await {
                warn!(key = %result.key(), error = %err, "Failed to release session result");
                failures.push(err);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Release(failures))
        }
    }
}
