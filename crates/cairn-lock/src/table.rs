//! The fixed table of named engine locks and their deterministic key layout.
//!
//! Every cooperating process on a node must resolve the same logical lock
//! name to the same OS-visible object. [`LockName::key`] is a pure function
//! over a fixed enumeration, so the mapping is stable across restarts and
//! identical in independently started processes. Key ranges never overlap:
//! each name owns one `KEY_RANGE`-sized slice of the key space, and the VSS
//! shards occupy disjoint contiguous slices.
//!
//! [`LockRegistry`] is the process-wide attach point. It is explicit state
//! constructed at startup and passed to users; there is no global singleton
//! and no static-initialization ordering to get wrong. Object identity
//! across processes is pinned by a key file per lock under the registry
//! directory; [`sweep`] is the administrative operation that enumerates and
//! removes those files.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_error::{CairnError, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::rwlock::RwLock;

/// Size of the key slice owned by each lock name.
pub const KEY_RANGE: u32 = 0x10000;

/// Number of VSS shards.
pub const VSS_SHARDS: u8 = 8;

/// A resolved lock key: one per name, disjoint by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LockKey(pub u32);

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The fixed enumeration of engine lock names.
///
/// Adding a name here requires bumping the layout in lockstep on every node;
/// the key assignment below is a wire/OS-object contract, not an internal
/// detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    /// Guards block-copy operations during version migration.
    CopyLock,
    /// Guards the extent map itself: the most contended lock in the engine.
    ExtentMap,
    /// Guards the extent-map free list.
    ExtentMapFreeList,
    /// Guards the extent-map secondary index.
    ExtentMapIndex,
    /// One of the eight version-state-store shards (1..=8).
    Vss(u8),
    /// Cluster master status (operations/administration group).
    MasterStatus,
    /// Node decommission mutex (operations/administration group).
    DecommissionServer,
}

/// Base key index per name. VSS shards extend from `BASE_VSS`.
const BASE_COPY_LOCK: u32 = 1;
const BASE_EXTENT_MAP: u32 = 2;
const BASE_EXTENT_MAP_FREE_LIST: u32 = 3;
const BASE_EXTENT_MAP_INDEX: u32 = 4;
const BASE_VSS: u32 = 5; // shards occupy 5..=12
const BASE_MASTER_STATUS: u32 = 13;
const BASE_DECOMMISSION_SERVER: u32 = 14;

impl LockName {
    /// Construct a VSS shard name; shards are numbered 1..=8.
    #[must_use]
    pub const fn vss(shard: u8) -> Option<Self> {
        if shard >= 1 && shard <= VSS_SHARDS {
            Some(Self::Vss(shard))
        } else {
            None
        }
    }

    /// The deterministic key for this name.
    ///
    /// Layout: `base_index * KEY_RANGE`, with VSS shard `s` at
    /// `(BASE_VSS + s - 1) * KEY_RANGE`. Pure function of the name alone.
    #[must_use]
    pub const fn key(self) -> LockKey {
        let index = match self {
            Self::CopyLock => BASE_COPY_LOCK,
            Self::ExtentMap => BASE_EXTENT_MAP,
            Self::ExtentMapFreeList => BASE_EXTENT_MAP_FREE_LIST,
            Self::ExtentMapIndex => BASE_EXTENT_MAP_INDEX,
            Self::Vss(shard) => BASE_VSS + (shard as u32) - 1,
            Self::MasterStatus => BASE_MASTER_STATUS,
            Self::DecommissionServer => BASE_DECOMMISSION_SERVER,
        };
        LockKey(index * KEY_RANGE)
    }

    /// Stable textual name (used in logs and timeout errors).
    #[must_use]
    pub fn as_str(self) -> String {
        match self {
            Self::CopyLock => "copy-lock".to_owned(),
            Self::ExtentMap => "extent-map".to_owned(),
            Self::ExtentMapFreeList => "extent-map-free-list".to_owned(),
            Self::ExtentMapIndex => "extent-map-index".to_owned(),
            Self::Vss(shard) => format!("vss-{shard}"),
            Self::MasterStatus => "master-status".to_owned(),
            Self::DecommissionServer => "decommission-server".to_owned(),
        }
    }

    /// Whether this lock belongs to the operations/administration group
    /// rather than the storage engine proper.
    #[must_use]
    pub const fn is_oam(self) -> bool {
        matches!(self, Self::MasterStatus | Self::DecommissionServer)
    }

    /// Every known lock name, VSS shards included.
    #[must_use]
    pub fn all() -> Vec<Self> {
        let mut names = vec![
            Self::CopyLock,
            Self::ExtentMap,
            Self::ExtentMapFreeList,
            Self::ExtentMapIndex,
        ];
        for shard in 1..=VSS_SHARDS {
            names.push(Self::Vss(shard));
        }
        names.push(Self::MasterStatus);
        names.push(Self::DecommissionServer);
        names
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Process-wide registry resolving [`LockName`]s to ready-to-use locks.
///
/// One registry per process, constructed at a startup hook and injected into
/// users. Each named lock's identity across processes is pinned by a key
/// file `{key:08x}.lock` under the registry directory; a registry attaches
/// to existing files or (in [`LockRegistry::create`]) lays them down.
#[derive(Debug)]
pub struct LockRegistry {
    dir: PathBuf,
    locks: Mutex<HashMap<LockKey, Arc<RwLock>>>,
}

impl LockRegistry {
    /// Create the registry directory and key files for every known name,
    /// then attach.
    ///
    /// Idempotent: existing key files are left in place.
    ///
    /// # Errors
    /// Propagates I/O errors creating the directory or key files.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        for name in LockName::all() {
            let path = key_file_path(&dir, name.key());
            if !path.exists() {
                fs::write(&path, name.as_str())?;
            }
        }
        info!(dir = %dir.display(), "lock registry created");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach to an existing registry directory without creating anything.
    ///
    /// # Errors
    /// Returns [`CairnError::LockUnavailable`] if the directory is missing;
    /// a process cannot safely proceed without its named locks.
    pub fn attach(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(CairnError::lock_unavailable(dir.display().to_string()));
        }
        debug!(dir = %dir.display(), "lock registry attached");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a named lock, verifying its key file still exists.
    ///
    /// # Errors
    /// Returns [`CairnError::LockUnavailable`] if the key file is gone
    /// (e.g. swept while the system was live — an operator error this layer
    /// reports but does not try to repair).
    pub fn lock(&self, name: LockName) -> Result<Arc<RwLock>> {
        let key = name.key();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let path = key_file_path(&self.dir, key);
        if !path.exists() {
            warn!(%name, %key, "named lock key file missing");
            return Err(CairnError::lock_unavailable(name.as_str()));
        }
        let lock = Arc::new(RwLock::new(name.as_str()));
        locks.insert(key, Arc::clone(&lock));
        Ok(lock)
    }

    /// The registry directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tear down the process-local attach state. Key files are left in
    /// place: the shared objects outlive any single process and are removed
    /// only by [`sweep`].
    pub fn shutdown(self) {
        let count = self.locks.lock().len();
        debug!(count, "lock registry shut down");
    }
}

fn key_file_path(dir: &Path, key: LockKey) -> PathBuf {
    dir.join(format!("{:08x}.lock", key.0))
}

/// Options for the administrative key sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOptions {
    /// Report what would be removed without removing anything.
    pub dry_run: bool,
    /// Leave operations/administration (OAM) keys in place.
    pub skip_oam: bool,
}

/// Outcome of a [`sweep`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys whose backing objects were removed (or would be, under dry-run).
    pub removed: Vec<LockKey>,
    /// Keys skipped because of [`SweepOptions::skip_oam`].
    pub skipped: Vec<LockKey>,
    /// Keys whose backing objects were already absent.
    pub missing: Vec<LockKey>,
}

/// Enumerate every known lock key range and remove the backing key files.
///
/// Idempotent: sweeping twice reports the second round as `missing`.
/// Running this against a live system is an operator decision; a lock whose
/// object is removed out from under it surfaces as `LockUnavailable` at the
/// next [`LockRegistry::lock`] call, not here.
///
/// # Errors
/// Propagates I/O errors other than not-found.
pub fn sweep(dir: impl AsRef<Path>, opts: SweepOptions) -> Result<SweepReport> {
    let dir = dir.as_ref();
    let mut report = SweepReport::default();
    for name in LockName::all() {
        let key = name.key();
        if opts.skip_oam && name.is_oam() {
            report.skipped.push(key);
            continue;
        }
        let path = key_file_path(dir, key);
        if !path.exists() {
            report.missing.push(key);
            continue;
        }
        if !opts.dry_run {
            fs::remove_file(&path)?;
        }
        info!(%name, %key, dry_run = opts.dry_run, "swept lock key");
        report.removed.push(key);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_disjoint_and_range_aligned() {
        let names = LockName::all();
        assert_eq!(names.len(), 6 + VSS_SHARDS as usize);
        let mut seen = HashSet::new();
        for name in &names {
            let key = name.key();
            assert_eq!(key.0 % KEY_RANGE, 0, "{name} key not range-aligned");
            assert!(seen.insert(key.0), "{name} key collides");
        }
    }

    #[test]
    fn key_layout_is_stable() {
        // This mapping is a cross-process contract: if any of these change,
        // running nodes disagree about which object is which lock.
        assert_eq!(LockName::CopyLock.key(), LockKey(0x0001_0000));
        assert_eq!(LockName::ExtentMap.key(), LockKey(0x0002_0000));
        assert_eq!(LockName::Vss(1).key(), LockKey(0x0005_0000));
        assert_eq!(LockName::Vss(8).key(), LockKey(0x000c_0000));
        assert_eq!(LockName::MasterStatus.key(), LockKey(0x000d_0000));
        assert_eq!(LockName::DecommissionServer.key(), LockKey(0x000e_0000));
    }

    #[test]
    fn vss_shard_bounds() {
        assert!(LockName::vss(0).is_none());
        assert!(LockName::vss(1).is_some());
        assert!(LockName::vss(8).is_some());
        assert!(LockName::vss(9).is_none());
    }

    #[test]
    fn registry_and_locks_are_debug_printable() {
        // Both types travel inside Results whose error paths get asserted
        // in tests and logged in diagnostics, so Debug must be derivable.
        let tmp = tempfile::tempdir().unwrap();
        let registry = LockRegistry::create(tmp.path()).unwrap();
        let lock = registry.lock(LockName::ExtentMap).unwrap();
        assert!(format!("{registry:?}").contains("LockRegistry"));
        assert!(format!("{lock:?}").contains("extent-map"));
    }

    #[test]
    fn attach_missing_dir_is_fatal() {
        let err = LockRegistry::attach("/nonexistent/cairn-locks").unwrap_err();
        assert!(matches!(err, CairnError::LockUnavailable { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn create_then_attach_resolves_same_names() {
        let tmp = tempfile::tempdir().unwrap();
        let created = LockRegistry::create(tmp.path()).unwrap();
        let attached = LockRegistry::attach(tmp.path()).unwrap();
        let a = created.lock(LockName::ExtentMap).unwrap();
        let b = attached.lock(LockName::ExtentMap).unwrap();
        // Same logical lock in two registries; cross-process identity is
        // the key file, in-process identity is per registry.
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn lock_after_sweep_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = LockRegistry::create(tmp.path()).unwrap();
        sweep(tmp.path(), SweepOptions::default()).unwrap();
        let err = registry.lock(LockName::CopyLock).unwrap_err();
        assert!(matches!(err, CairnError::LockUnavailable { .. }));
    }

    #[test]
    fn sweep_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        LockRegistry::create(tmp.path()).unwrap();
        let first = sweep(tmp.path(), SweepOptions::default()).unwrap();
        assert_eq!(first.removed.len(), LockName::all().len());
        assert!(first.missing.is_empty());

        let second = sweep(tmp.path(), SweepOptions::default()).unwrap();
        assert!(second.removed.is_empty());
        assert_eq!(second.missing.len(), LockName::all().len());
    }

    #[test]
    fn sweep_dry_run_removes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        LockRegistry::create(tmp.path()).unwrap();
        let report = sweep(
            tmp.path(),
            SweepOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report.removed.len(), LockName::all().len());
        // Files still present: a second real sweep removes them all.
        let real = sweep(tmp.path(), SweepOptions::default()).unwrap();
        assert_eq!(real.removed.len(), LockName::all().len());
    }

    #[test]
    fn sweep_skip_oam_preserves_admin_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = LockRegistry::create(tmp.path()).unwrap();
        let report = sweep(
            tmp.path(),
            SweepOptions {
                skip_oam: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(report.skipped.len(), 2);
        // OAM locks survive the engine sweep.
        assert!(registry.lock(LockName::MasterStatus).is_ok());
        assert!(registry.lock(LockName::ExtentMap).is_err());
    }
}
