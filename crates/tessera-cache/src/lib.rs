//! Content-addressed result cache with call coalescing.
//!
//! This crate provides the engine layer a session cache sits on:
//! - [`CacheEngine`] / [`CacheResult`]: the coalescing primitive and the
//!   reference-counted handle it returns
//! - [`MemoryCache`]: an in-memory engine implementing both
//! - [`Digest`]: content-derived keys, with a distinguished zero key
//! - [`CallContext`]: cancellation, tracing span and telemetry scope for a call
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_cache::{CacheEngine, CallContext, Digest, MemoryCache, ValueWithCallbacks, initializer};
//!
//! let cache = MemoryCache::new();
//! let handle = cache
//!     .get_or_initialize_with_callbacks(
//!         &CallContext::new(),
//!         Digest::of("compile main.rs"),
//!         false,
//!         initializer(|_ctx| async { Ok(ValueWithCallbacks::new(42)) }),
//!     )
//!     .await?;
//! ```

mod context;
mod digest;
mod engine;
mod error;
mod keys;
mod memory;

pub use context::CallContext;
pub use digest::Digest;
pub use engine::{
    CacheEngine, CacheResult, Initializer, OnReleaseFn, PostCallFn, ValueWithCallbacks,
    initializer,
};
pub use error::{Error, Result};
pub use keys::KeySet;
pub use memory::{MemoryCache, MemoryResult};
