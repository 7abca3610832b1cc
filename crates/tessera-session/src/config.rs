//! Configuration for the session cache.

use serde::{Deserialize, Serialize};

/// How a session treats calls that race with, or follow, its closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedSessionPolicy {
    /// Reject the call with an error; a released handle is never returned.
    #[default]
    Strict,

    /// Let the call finish, log an error, release the handle immediately and
    /// still return it. The returned handle must not be used for further work.
    Tolerant,
}

/// Configuration for the session cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Behavior for calls that observe a closed session.
    pub closed_policy: ClosedSessionPolicy,
}

impl SessionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the closed-session policy.
    pub fn with_closed_policy(mut self, policy: ClosedSessionPolicy) -> Self {
        self.closed_policy = policy;
        self
    }

    /// Shorthand for [`ClosedSessionPolicy::Tolerant`].
    pub fn tolerant(self) -> Self {
        self.with_closed_policy(ClosedSessionPolicy::Tolerant)
    }
}
