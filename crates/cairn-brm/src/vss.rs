//! Version state store: which version of each extent is currently visible.
//!
//! Readers consult the VSS instead of the extent map so the hot read path
//! contends on one of eight shards rather than on the extent-map lock.
//! Shard assignment hashes the extent id with a fixed multiplier (the same
//! fibonacci-hash constant style the lock tables use) so every process
//! agrees which shard an extent lives in.

use std::collections::HashMap;

use cairn_types::{ExtentId, VersionId};
use parking_lot::Mutex;

/// Number of VSS shards; matches the named `vss-1..vss-8` locks.
pub const SHARD_COUNT: usize = 8;

/// Sharded extent → visible-version table.
#[derive(Debug)]
pub struct VersionStateStore {
    shards: [Mutex<HashMap<ExtentId, VersionId>>; SHARD_COUNT],
}

impl Default for VersionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    /// Shard index for an extent. Pure function: identical across
    /// processes.
    #[must_use]
    pub fn shard_of(extent: ExtentId) -> usize {
        let h = extent.0.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (h >> 61) as usize // top 3 bits: 0..8
    }

    /// Record `version` as the visible version of `extent`.
    ///
    /// Monotonic: a stale publish (lower version) is ignored, which keeps
    /// commit retry idempotent at this layer too.
    pub fn publish(&self, extent: ExtentId, version: VersionId) {
        let mut shard = self.shards[Self::shard_of(extent)].lock();
        let slot = shard.entry(extent).or_insert(version);
        if version > *slot {
            *slot = version;
        }
    }

    /// The visible version of `extent`, if the extent is known.
    #[must_use]
    pub fn visible(&self, extent: ExtentId) -> Option<VersionId> {
        self.shards[Self::shard_of(extent)].lock().get(&extent).copied()
    }

    /// Drop an extent from the store (extent deallocation).
    pub fn remove(&self, extent: ExtentId) {
        self.shards[Self::shard_of(extent)].lock().remove(&extent);
    }
}
