//! Concurrent digest sets.

use std::sync::Arc;

use dashmap::DashSet;

use crate::digest::Digest;

/// A shared, concurrent set of digests.
///
/// Clones share the same underlying set. Membership updates are lock-free
/// per shard, so the set can sit on the hot path of every cache call.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Arc<DashSet<Digest>>,
}

impl KeySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert `key`, returning `true` if it was already present.
    pub fn check_and_insert(&self, key: Digest) -> bool {
        !self.keys.insert(key)
    }

    /// Insert `key` without reporting prior membership.
    pub fn insert(&self, key: Digest) {
        self.keys.insert(key);
    }

    /// Whether `key` is in the set.
    pub fn contains(&self, key: &Digest) -> bool {
        self.keys.contains(key)
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

}
