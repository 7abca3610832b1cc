//! Session-scoped deduplication and lifecycle for a content-addressed cache.
//!
//! This crate wraps a [`tessera_cache::CacheEngine`] for the lifetime of one
//! logical session (a client connection, a build invocation) with:
//! - Call coalescing: concurrent calls for the same key run the work once
//! - Handle tracking: every result handed out is released when the session closes
//! - Closed-session handling: strict or tolerant, see [`ClosedSessionPolicy`]
//! - Once-per-key telemetry, with [`with_repeated_telemetry`] to re-report in a scope
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_cache::{CallContext, Digest, MemoryCache};
//! use tessera_session::{SessionCache, span_telemetry, with_telemetry};
//!
//! let session = SessionCache::new(MemoryCache::new());
//! let ctx = CallContext::new();
//!
//! let telemetry = with_telemetry(span_telemetry("compile"));
//! let handle = session
//!     .get_or_initialize(&ctx, Digest::of("compile main.rs"), |_ctx| async { Ok(42) }, &[&telemetry])
//!     .await?;
//!
//! session.release_and_close(&ctx).await?;
//! ```

mod cache;
mod config;
mod error;
mod options;
mod telemetry;

pub use cache::SessionCache;
pub use config::{ClosedSessionPolicy, SessionConfig};
pub use error::{Error, ReleaseErrors, Result};
pub use options::{CallOpt, CallOpts, with_telemetry};
pub use telemetry::{TelemetryDone, TelemetryFunc, span_telemetry, with_repeated_telemetry};
