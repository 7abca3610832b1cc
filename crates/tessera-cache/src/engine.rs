//! Engine and handle abstractions.
//!
//! [`CacheEngine`] is the coalescing primitive a session wraps; [`CacheResult`]
//! is the reference-counted handle it hands back. Sessions depend only on
//! these traits, so any store that can coalesce by key and count references
//! can back them.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::CallContext;
use crate::digest::Digest;
use crate::error::Result;

/// Callback run for every caller that receives a value.
pub type PostCallFn = Arc<dyn Fn(CallContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback run once, when the last reference to a value is released.
pub type OnReleaseFn = Box<dyn FnOnce(CallContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Work function producing a value for a key.
pub type Initializer<V> =
    Box<dyn FnOnce(CallContext) -> BoxFuture<'static, anyhow::Result<ValueWithCallbacks<V>>> + Send>;

/// A freshly produced value plus its lifecycle callbacks.
pub struct ValueWithCallbacks<V> {
    /// The produced value.
    pub value: V,

    /// Run after each successful lookup, hit or miss.
    pub post_call: Option<PostCallFn>,

    /// Run when the value's last reference is released.
    pub on_release: Option<OnReleaseFn>,
}

impl<V> ValueWithCallbacks<V> {
    /// Wrap a value with no callbacks.
    pub fn new(value: V) -> Self {
        Self {
            value,
            post_call: None,
            on_release: None,
        }
    }

    /// Attach a post-call callback.
    pub fn with_post_call<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.post_call = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Attach a release callback.
    pub fn with_on_release<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_release = Some(Box::new(move |ctx| f(ctx).boxed()));
        self
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for ValueWithCallbacks<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueWithCallbacks")
            .field("value", &self.value)
            .field("post_call", &self.post_call.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

/// Box an async work function as an [`Initializer`].
pub fn initializer<V, F, Fut>(f: F) -> Initializer<V>
where
    F: FnOnce(CallContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<ValueWithCallbacks<V>>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

/// A reference-counted handle to a cached value.
///
/// Clones share a single reference: releasing any clone releases it, and
/// releasing it again is a no-op.
#[async_trait]
pub trait CacheResult: Clone + Send + Sync + 'static {
    /// The cached value type.
    type Value: Send + Sync + 'static;

    /// Key the value was requested under.
    fn key(&self) -> &Digest;

    /// The cached value.
    fn value(&self) -> &Self::Value;

    /// Whether this caller joined an existing computation or entry.
    fn was_cache_hit(&self) -> bool;

    /// Whether this reference has already been released.
    fn is_released(&self) -> bool;

    /// Release this reference.
    async fn release(&self, ctx: &CallContext) -> Result<()>;
}

/// A content-addressed store that coalesces concurrent calls by key.
#[async_trait]
pub trait CacheEngine: Send + Sync {
    /// The cached value type.
    type Value: Send + Sync + 'static;

    /// Handle type returned to callers.
    type Handle: CacheResult<Value = Self::Value>;

    /// Return a handle for `key`, running `init` only if no shareable result
    /// exists or is in flight.
    ///
    /// With `skip_dedupe` the initializer always runs and its result is
    /// never shared with other callers.
    async fn get_or_initialize_with_callbacks(
        &self,
        ctx: &CallContext,
        key: Digest,
        skip_dedupe: bool,
        init: Initializer<Self::Value>,
    ) -> Result<Self::Handle>;
}
