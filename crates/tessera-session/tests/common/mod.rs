//! Common test utilities for session cache integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tessera_cache::{CacheEngine, CacheResult, CallContext, Digest, Initializer};
use tessera_session::{Error, TelemetryDone, TelemetryFunc};

/// Record of everything a [`ScriptedEngine`] did.
#[derive(Debug, Default)]
pub struct Ledger {
    runs: AtomicUsize,
    next_id: AtomicUsize,
    issued: Mutex<Vec<usize>>,
    releases: Mutex<HashMap<usize, usize>>,
    failing: Mutex<HashSet<Digest>>,
    cancelled_releases: AtomicUsize,
}

impl Ledger {
    /// Number of initializers executed.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Ids of every handle issued, in issue order.
    pub fn issued(&self) -> Vec<usize> {
        self.issued.lock().clone()
    }

    /// How many times `release` was called on handle `id`.
    pub fn release_count(&self, id: usize) -> usize {
        self.releases.lock().get(&id).copied().unwrap_or(0)
    }

    /// Releases that were handed an already-cancelled context.
    pub fn cancelled_releases(&self) -> usize {
        self.cancelled_releases.load(Ordering::SeqCst)
    }

    /// Total `release` calls across all handles.
    pub fn total_releases(&self) -> usize {
        self.releases.lock().values().sum()
    }
}

/// Engine double that never coalesces and counts every release per handle.
///
/// Unlike a real engine it does not treat repeated releases as no-ops, so a
/// session that releases a handle twice shows up as a count of 2.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    ledger: Arc<Ledger>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Make every release of a handle for `key` fail.
    pub fn fail_release(&self, key: Digest) {
        self.ledger.failing.lock().insert(key);
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedHandle {
    id: usize,
    key: Digest,
    value: Arc<String>,
    ledger: Arc<Ledger>,
}

impl ScriptedHandle {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl CacheResult for ScriptedHandle {
    type Value = String;

    fn key(&self) -> &Digest {
        &self.key
    }

    fn value(&self) -> &String {
        &self.value
    }

    fn was_cache_hit(&self) -> bool {
        false
    }

    fn is_released(&self) -> bool {
        self.ledger.release_count(self.id) > 0
    }

    async fn release(&self, ctx: &CallContext) -> tessera_cache::Result<()> {
        *self.ledger.releases.lock().entry(self.id).or_default() += 1;
        if ctx.is_cancelled() {
            self.ledger.cancelled_releases.fetch_add(1, Ordering::SeqCst);
        }
        if self.ledger.failing.lock().contains(&self.key) {
            return Err(tessera_cache::Error::release(
                self.key,
                anyhow::anyhow!("scripted release failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheEngine for ScriptedEngine {
    type Value = String;
    type Handle = ScriptedHandle;

    async fn get_or_initialize_with_callbacks(
        &self,
        ctx: &CallContext,
        key: Digest,
        _skip_dedupe: bool,
        init: Initializer<String>,
    ) -> tessera_cache::Result<ScriptedHandle> {
        self.ledger.runs.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let produced = init(ctx.clone())
            .await
            .map_err(tessera_cache::Error::initializer)?;

        let id = self.ledger.next_id.fetch_add(1, Ordering::SeqCst);
        self.ledger.issued.lock().push(id);
        Ok(ScriptedHandle {
            id,
            key,
            value: Arc::new(produced.value),
            ledger: Arc::clone(&self.ledger),
        })
    }
}

/// One completion reported to a telemetry hook.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub value: Option<String>,
    pub cached: bool,
    pub error: Option<String>,
}

/// Telemetry hook that records what it was told.
#[derive(Clone, Default)]
pub struct TelemetryRecorder {
    started: Arc<AtomicUsize>,
    completions: Arc<Mutex<Vec<Completion>>>,
}

impl TelemetryRecorder {
    pub fn hook(&self) -> TelemetryFunc<String> {
        let recorder = self.clone();
        Arc::new(move |ctx: &CallContext| {
            recorder.started.fetch_add(1, Ordering::SeqCst);
            let completions = Arc::clone(&recorder.completions);
            let done: TelemetryDone<String> =
                Box::new(move |value: Option<&String>, cached: bool, err: Option<&Error>| {
                    completions.lock().push(Completion {
                        value: value.cloned(),
                        cached,
                        error: err.map(|e| e.to_string()),
                    });
                });
            (ctx.clone(), done)
        })
    }

    /// Number of times the hook was entered.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.completions.lock().clone()
    }
}
