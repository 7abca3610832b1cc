//! In-memory coalescing cache engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{Instrument, debug, trace, warn};

use crate::context::CallContext;
use crate::digest::Digest;
use crate::engine::{
    CacheEngine, CacheResult, Initializer, OnReleaseFn, PostCallFn, ValueWithCallbacks,
};
use crate::error::{Error, Result};

type SharedCall<V> = Shared<BoxFuture<'static, Result<Arc<Computed<V>>>>>;

/// A produced value and its remaining lifecycle callbacks.
struct Computed<V> {
    value: V,
    post_call: Option<PostCallFn>,
    on_release: Mutex<Option<OnReleaseFn>>,
}

impl<V> From<ValueWithCallbacks<V>> for Computed<V> {
    fn from(produced: ValueWithCallbacks<V>) -> Self {
        Self {
            value: produced.value,
            post_call: produced.post_call,
            on_release: Mutex::new(produced.on_release),
        }
    }
}

/// A keyed entry: one in-flight or completed computation plus its holders.
struct Entry<V> {
    generation: u64,
    refs: usize,
    call: SharedCall<V>,
}

struct Store<V> {
    entries: Mutex<HashMap<Digest, Entry<V>>>,
    next_generation: AtomicU64,
}

impl<V> Store<V> {
    /// Drop one reference on `key`'s entry, returning the entry if that was
    /// the last one. Stale generations are ignored.
    fn drop_ref(&self, key: &Digest, generation: u64) -> Option<Entry<V>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.generation != generation {
            return None;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key)
        } else {
            None
        }
    }

    /// Forget a failed computation so the next call retries it.
    fn remove_failed(&self, key: &Digest, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.generation == generation) {
            entries.remove(key);
        }
    }
}

/// Holds a reference on an entry while its caller waits for the result.
///
/// If the caller is dropped mid-wait, the reference is given back. When that
/// leaves the entry unreferenced the computation is abandoned.
struct Waiter<'a, V> {
    store: &'a Store<V>,
    key: Digest,
    generation: u64,
    armed: bool,
}

impl<V> Waiter<'_, V> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<V> Drop for Waiter<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(entry) = self.store.drop_ref(&self.key, self.generation) else {
            return;
        };
        match entry.call.peek() {
            // Completed between wake-up and the caller going away.
            Some(Ok(computed)) => spawn_on_release(self.key, computed),
            _ => trace!(key = %self.key, "Abandoned in-flight initializer"),
        }
    }
}

fn spawn_on_release<V>(key: Digest, computed: &Computed<V>) {
    let Some(on_release) = computed.on_release.lock().take() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(err) = on_release(CallContext::new()).await {
                    warn!(key = %key, error = %err, "Release callback failed");
                }
            });
        }
        Err(_) => warn!(key = %key, "No runtime available to run release callback"),
    }
}

async fn run<V>(ctx: CallContext, init: Initializer<V>) -> Result<Arc<Computed<V>>> {
    let span = ctx.span().clone();
    let produced = init(ctx).instrument(span).await.map_err(Error::initializer)?;
    Ok(Arc::new(Computed::from(produced)))
}

/// In-memory content-addressed cache with call coalescing.
///
/// Concurrent callers for the same key share one initializer execution and
/// each receive their own reference. An entry lives until its last reference
/// is released; there is no eviction beyond that.
pub struct MemoryCache<V> {
    store: Arc<Store<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryCache<V> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Number of live entries (in flight or referenced).
    pub fn len(&self) -> usize {
        self.store.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.store.entries.lock().is_empty()
    }

    /// Outstanding references on `key`'s entry, if it exists.
    pub fn ref_count(&self, key: &Digest) -> Option<usize> {
        self.store.entries.lock().get(key).map(|e| e.refs)
    }
}

impl<V: Send + Sync + 'static> MemoryCache<V> {
    async fn finish(&self, ctx: &CallContext, handle: MemoryResult<V>) -> Result<MemoryResult<V>> {
        let Some(post_call) = handle.inner.computed.post_call.clone() else {
            return Ok(handle);
        };
        let mut unclaimed = Unclaimed {
            handle,
            armed: true,
        };
        let outcome = post_call(ctx.clone()).await;
        let handle = unclaimed.claim();
        if let Err(err) = outcome {
            if let Err(release_err) = handle.release(&ctx.without_cancel()).await {
                warn!(key = %handle.key(), error = %release_err, "Release after failed post-call failed");
            }
            return Err(Error::post_call(err));
        }
        Ok(handle)
    }
}

/// A handle not yet handed to its caller.
///
/// If the caller goes away first, the reference is given back.
struct Unclaimed<V> {
    handle: MemoryResult<V>,
    armed: bool,
}

impl<V> Unclaimed<V> {
    fn claim(&mut self) -> MemoryResult<V> {
        self.armed = false;
        self.handle.clone()
    }
}

impl<V> Drop for Unclaimed<V> {
    fn drop(&mut self) {
        if self.armed {
            trace!(key = %self.handle.inner.key, "Caller dropped before post-call finished");
            self.handle.release_detached();
        }
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> CacheEngine for MemoryCache<V> {
    type Value = V;
    type Handle = MemoryResult<V>;

    async fn get_or_initialize_with_callbacks(
        &self,
        ctx: &CallContext,
        key: Digest,
        skip_dedupe: bool,
        init: Initializer<V>,
    ) -> Result<MemoryResult<V>> {
        if skip_dedupe || key.is_zero() {
            trace!(key = %key, skip_dedupe, "Running unshared initializer");
            let computed = run(ctx.clone(), init).await?;
            let handle = MemoryResult::new(key, computed, false, Owner::Standalone);
            return self.finish(ctx, handle).await;
        }

        let (call, generation, hit) = {
            let mut entries = self.store.entries.lock();
            match entries.get_mut(&key) {
                // A failed entry is about to be removed by its waiters; start over.
                Some(entry) if !matches!(entry.call.peek(), Some(Err(_))) => {
                    entry.refs += 1;
                    (entry.call.clone(), entry.generation, true)
                }
                _ => {
                    let generation = self.store.next_generation.fetch_add(1, Ordering::Relaxed);
                    let call = run(ctx.clone(), init).boxed().shared();
                    entries.insert(
                        key,
                        Entry {
                            generation,
                            refs: 1,
                            call: call.clone(),
                        },
                    );
                    (call, generation, false)
                }
            }
        };

        if hit {
            trace!(key = %key, "Joining existing entry");
        }

        let mut waiter = Waiter {
            store: &self.store,
            key,
            generation,
            armed: true,
        };
        let outcome = call.await;
        waiter.disarm();

        match outcome {
            Ok(computed) => {
                let owner = Owner::Shared {
                    store: Arc::clone(&self.store),
                    generation,
                };
                let handle = MemoryResult::new(key, computed, hit, owner);
                self.finish(ctx, handle).await
            }
            Err(err) => {
                debug!(key = %key, error = %err, "Initializer failed, dropping entry");
                self.store.remove_failed(&key, generation);
                Err(err)
            }
        }
    }
}

enum Owner<V> {
    /// Produced outside the keyed store; this handle is the only reference.
    Standalone,
    Shared {
        store: Arc<Store<V>>,
        generation: u64,
    },
}

struct ResultInner<V> {
    key: Digest,
    computed: Arc<Computed<V>>,
    hit: bool,
    released: AtomicBool,
    owner: Owner<V>,
}

/// Handle returned by [`MemoryCache`].
pub struct MemoryResult<V> {
    inner: Arc<ResultInner<V>>,
}

impl<V> Clone for MemoryResult<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> MemoryResult<V> {
    fn new(key: Digest, computed: Arc<Computed<V>>, hit: bool, owner: Owner<V>) -> Self {
        Self {
            inner: Arc::new(ResultInner {
                key,
                computed,
                hit,
                released: AtomicBool::new(false),
                owner,
            }),
        }
    }

    /// Mark this reference released and drop it from the store. Returns
    /// whether it was the last reference to the value.
    fn drop_reference(&self) -> bool {
        let key = self.inner.key;
        if self.inner.released.swap(true, Ordering::AcqRel) {
            trace!(key = %key, "Reference already released");
            return false;
        }
        match &self.inner.owner {
            Owner::Standalone => true,
            Owner::Shared { store, generation } => store.drop_ref(&key, *generation).is_some(),
        }
    }

    /// Release without waiting, for callers that can no longer await.
    fn release_detached(&self) {
        if self.drop_reference() {
            spawn_on_release(self.inner.key, &self.inner.computed);
        }
    }
}

impl<V> std::fmt::Debug for MemoryResult<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResult")
            .field("key", &self.inner.key)
            .field("hit", &self.inner.hit)
            .field("released", &self.inner.released.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> CacheResult for MemoryResult<V> {
    type Value = V;

    fn key(&self) -> &Digest {
        &self.inner.key
    }

    fn value(&self) -> &V {
        &self.inner.computed.value
    }

    fn was_cache_hit(&self) -> bool {
        self.inner.hit
    }

    fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    async fn release(&self, ctx: &CallContext) -> Result<()> {
        let key = self.inner.key;
        if !self.drop_reference() {
            return Ok(());
        }

        debug!(key = %key, "Released last reference");
        let on_release = self.inner.computed.on_release.lock().take();
        let Some(on_release) = on_release else {
            return Ok(());
        };
        let cleanup = on_release(ctx.clone());
        // Spawned so the callback still completes if this release is dropped.
        let outcome = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime.spawn(cleanup).await.unwrap_or_else(|err| {
                Err(anyhow::anyhow!("release callback did not complete: {err}"))
            }),
            Err(_) => cleanup.await,
        };
        outcome.map_err(|err| Error::release(key, err))
    }
}
