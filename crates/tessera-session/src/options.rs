//! Per-call options.
//!
//! Options are folded, in order, into a [`CallOpts`] value; later options
//! override earlier ones. New options add fields to [`CallOpts`] without
//! touching the signatures of the calls that accept them.

use crate::telemetry::TelemetryFunc;

/// Resolved options for a single cache call.
pub struct CallOpts<V> {
    /// Hook deciding how the call is observed, if any.
    pub telemetry: Option<TelemetryFunc<V>>,
}

impl<V> Default for CallOpts<V> {
    fn default() -> Self {
        Self { telemetry: None }
    }
}

impl<V> Clone for CallOpts<V> {
    fn clone(&self) -> Self {
        Self {
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<V> std::fmt::Debug for CallOpts<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOpts")
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

impl<V> CallOpts<V> {
    /// Fold `opts` into a default option set.
    pub fn from_opts(opts: &[&dyn CallOpt<V>]) -> Self {
        let mut resolved = Self::default();
        for opt in opts {
            opt.apply(&mut resolved);
        }
        resolved
    }
}

/// Something that can adjust the options of a cache call.
pub trait CallOpt<V>: Send + Sync {
    /// Apply this option to `opts`.
    fn apply(&self, opts: &mut CallOpts<V>);
}

/// A full option set replaces whatever was resolved before it.
impl<V> CallOpt<V> for CallOpts<V> {
    fn apply(&self, opts: &mut CallOpts<V>) {
        *opts = self.clone();
    }
}

impl<V, F> CallOpt<V> for F
where
    F: Fn(&mut CallOpts<V>) + Send + Sync,
{
    fn apply(&self, opts: &mut CallOpts<V>) {
        self(opts);
    }
}

/// Attach a telemetry hook to a call.
pub fn with_telemetry<V>(telemetry: TelemetryFunc<V>) -> impl CallOpt<V> {
    move |opts: &mut CallOpts<V>| opts.telemetry = Some(telemetry.clone())
}
