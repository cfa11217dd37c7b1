//! The Block Resolution Manager: transaction/versioning protocol over the
//! extent map and VSS, bracketed by the named engine locks.
//!
//! Locking discipline:
//! - Every mutation takes the named extent-map lock (write side) with a
//!   bounded timeout; `LockTimeout` is surfaced to the caller, which owns
//!   the retry-vs-abort decision.
//! - VSS publication happens inside the same critical section as the
//!   version-pointer swap, under the shard's named lock, so a reader never
//!   sees a version the extent map has not committed.
//! - No lock is ever held across network I/O: callers serialize messages
//!   entirely outside these methods.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cairn_error::{CairnError, Result};
use cairn_lock::{LockName, LockRegistry, RwLock};
use cairn_types::{BlockId, ExtentId, Hwm, SessionId, TableOid, TxnId, UniqueId, VersionId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::extent_map::{ExtentMap, ExtentSnapshot};
use crate::vss::VersionStateStore;

/// Default bound on named-lock acquisition inside BRM operations.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-transaction bookkeeping.
#[derive(Debug, Clone)]
pub struct TxnContext {
    pub session: SessionId,
    pub txn: TxnId,
    pub unique_id: UniqueId,
    /// Tables this transaction has touched (for catalog invalidation by the
    /// layer above).
    pub table_oids: Vec<TableOid>,
}

/// The BRM proper. One per process, injected into the server/client layers.
pub struct BlockResolutionManager {
    extent_map_lock: Arc<RwLock>,
    vss_locks: Vec<Arc<RwLock>>,
    map: Mutex<ExtentMap>,
    vss: VersionStateStore,
    txns: Mutex<HashMap<TxnId, TxnContext>>,
    next_txn: AtomicU64,
    lock_timeout: Duration,
}

impl BlockResolutionManager {
    /// Attach to the named locks and start with an empty extent map.
    ///
    /// # Errors
    /// Propagates [`CairnError::LockUnavailable`] if any required named lock
    /// cannot be resolved — fatal to the caller by contract.
    pub fn new(registry: &LockRegistry) -> Result<Self> {
        Self::with_lock_timeout(registry, DEFAULT_LOCK_TIMEOUT)
    }

    /// As [`BlockResolutionManager::new`] with an explicit lock timeout
    /// (tests use short timeouts).
    ///
    /// # Errors
    /// Propagates [`CairnError::LockUnavailable`].
    pub fn with_lock_timeout(registry: &LockRegistry, lock_timeout: Duration) -> Result<Self> {
        let extent_map_lock = registry.lock(LockName::ExtentMap)?;
        let mut vss_locks = Vec::with_capacity(crate::vss::SHARD_COUNT);
        for shard in 1..=crate::vss::SHARD_COUNT as u8 {
            let name = LockName::vss(shard)
                .ok_or_else(|| CairnError::internal(format!("bad vss shard {shard}")))?;
            vss_locks.push(registry.lock(name)?);
        }
        info!("block resolution manager attached");
        Ok(Self {
            extent_map_lock,
            vss_locks,
            map: Mutex::new(ExtentMap::new()),
            vss: VersionStateStore::new(),
            txns: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            lock_timeout,
        })
    }

    // -----------------------------------------------------------------------
    // Transaction lifecycle
    // -----------------------------------------------------------------------

    /// Start a transaction for a session.
    pub fn begin_txn(&self, session: SessionId, unique_id: UniqueId) -> TxnId {
        let txn = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        self.txns.lock().insert(
            txn,
            TxnContext {
                session,
                txn,
                unique_id,
                table_oids: Vec::new(),
            },
        );
        debug!(%session, %txn, "transaction started");
        txn
    }

    /// Register a transaction whose id was assigned elsewhere (the session
    /// layer hands ids out cluster-wide; write engines adopt them on first
    /// use). Idempotent for an already-known id.
    ///
    /// # Errors
    /// `InvalidTransactionState` for the reserved null id.
    pub fn adopt_txn(&self, txn: TxnId, session: SessionId, unique_id: UniqueId) -> Result<()> {
        if !txn.is_valid() {
            return Err(CairnError::InvalidTransactionState);
        }
        self.txns.lock().entry(txn).or_insert_with(|| {
            debug!(%session, %txn, "transaction adopted");
            TxnContext {
                session,
                txn,
                unique_id,
                table_oids: Vec::new(),
            }
        });
        // Locally generated ids must never collide with adopted ones.
        self.next_txn.fetch_max(txn.0 + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Record that `txn` modifies `table`.
    ///
    /// # Errors
    /// `InvalidTransactionState` if the transaction is unknown.
    pub fn add_table(&self, txn: TxnId, table: TableOid) -> Result<()> {
        let mut txns = self.txns.lock();
        let ctx = txns
            .get_mut(&txn)
            .ok_or(CairnError::InvalidTransactionState)?;
        if !ctx.table_oids.contains(&table) {
            ctx.table_oids.push(table);
        }
        Ok(())
    }

    /// Context lookup (diagnostics, server-side session accounting).
    #[must_use]
    pub fn txn_context(&self, txn: TxnId) -> Option<TxnContext> {
        self.txns.lock().get(&txn).cloned()
    }

    // -----------------------------------------------------------------------
    // Extent administration
    // -----------------------------------------------------------------------

    /// Register a new extent. Publishes its initial version to the VSS so
    /// readers can resolve it immediately.
    ///
    /// # Errors
    /// `LockTimeout`, or `Internal` on duplicate ids.
    pub fn create_extent(&self, extent: ExtentId, hwm: Hwm) -> Result<()> {
        let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
        self.map.lock().insert(extent, hwm)?;
        self.publish_vss(extent, VersionId::INITIAL)?;
        Ok(())
    }

    /// Deallocate an extent (table drop). Fails while a provisional write
    /// is in flight; the VSS entry goes with it.
    ///
    /// # Errors
    /// `LockTimeout`, `ExtentBusy`, or `NoSuchExtent`.
    pub fn delete_extent(&self, extent: ExtentId) -> Result<()> {
        let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
        self.map.lock().remove(extent)?;
        let shard = VersionStateStore::shard_of(extent);
        let _vss_guard = self.vss_locks[shard].write_for(self.lock_timeout)?;
        self.vss.remove(extent);
        Ok(())
    }

    /// Diagnostic snapshot of one extent, taken under the read lock.
    ///
    /// # Errors
    /// `LockTimeout` or `NoSuchExtent`.
    pub fn snapshot(&self, extent: ExtentId) -> Result<ExtentSnapshot> {
        let _guard = self.extent_map_lock.read_for(self.lock_timeout)?;
        self.map.lock().snapshot(extent)
    }

    // -----------------------------------------------------------------------
    // Write protocol
    // -----------------------------------------------------------------------

    /// Take the write intent on an extent: `Committed(V)` becomes
    /// `Provisional(V+1, txn)`. Readers of the committed version are
    /// unaffected.
    ///
    /// # Errors
    /// `ExtentBusy` if another transaction holds the intent, `LockTimeout`,
    /// `NoSuchExtent`, or `InvalidTransactionState` for an unknown txn.
    pub fn begin_write(&self, txn: TxnId, extent: ExtentId) -> Result<VersionId> {
        self.require_txn(txn)?;
        let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
        let version = self.map.lock().begin_write(extent, txn)?;
        debug!(%txn, %extent, %version, "write intent taken");
        Ok(version)
    }

    /// Stage the new HWM for a provisionally held extent.
    ///
    /// # Errors
    /// `LockTimeout`, `NoSuchExtent`, or `InvalidTransactionState` if the
    /// extent is not provisional under `txn`.
    pub fn set_hwm(&self, txn: TxnId, extent: ExtentId, hwm: Hwm) -> Result<()> {
        self.require_txn(txn)?;
        let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
        self.map.lock().stage_hwm(extent, txn, hwm)
    }

    /// The committed (reader-visible) version of an extent.
    ///
    /// # Errors
    /// `LockTimeout` or `NoSuchExtent`.
    pub fn committed_version(&self, extent: ExtentId) -> Result<VersionId> {
        let _guard = self.extent_map_lock.read_for(self.lock_timeout)?;
        Ok(self.map.lock().get(extent)?.committed)
    }

    /// The version the VSS currently reports visible, bypassing the extent
    /// map (the hot read path).
    #[must_use]
    pub fn visible_version(&self, extent: ExtentId) -> Option<VersionId> {
        self.vss.visible(extent)
    }

    /// Commit a transaction: publish every extent it holds provisionally.
    ///
    /// Publication is extent-by-extent and idempotent — if a prior commit
    /// attempt landed some extents before failing, retrying re-applies only
    /// the rest. The transaction is retired afterwards.
    ///
    /// # Errors
    /// `LockTimeout`, or the first per-extent failure encountered (the
    /// remaining extents are still attempted so a retry has less to do).
    pub fn commit(&self, txn: TxnId) -> Result<Vec<ExtentId>> {
        self.require_txn(txn)?;
        let committed = {
            let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
            let mut map = self.map.lock();
            let extents = map.provisional_extents(txn);
            let mut committed = Vec::with_capacity(extents.len());
            let mut first_err = None;
            for extent in extents {
                let expected = match map.get(extent).map(|e| e.provisional) {
                    Ok(Some(p)) => p.version,
                    Ok(None) | Err(_) => continue,
                };
                match map.publish(extent, txn, expected) {
                    Ok(version) => {
                        self.publish_vss(extent, version)?;
                        committed.push(extent);
                    }
                    Err(err) => {
                        warn!(%txn, %extent, %err, "publish failed; continuing");
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
            committed
        };
        self.txns.lock().remove(&txn);
        info!(%txn, extents = committed.len(), "transaction committed");
        Ok(committed)
    }

    /// Roll back a transaction: discard every provisional extent it owns,
    /// restoring the prior committed version and HWM. Safe to call after a
    /// partially successful commit — already-published extents are not
    /// touched. The transaction is retired afterwards.
    ///
    /// # Errors
    /// `LockTimeout`.
    pub fn rollback(&self, txn: TxnId) -> Result<Vec<ExtentId>> {
        let discarded = {
            let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
            let mut map = self.map.lock();
            let extents = map.provisional_extents(txn);
            for extent in &extents {
                map.discard(*extent, txn);
            }
            extents
        };
        self.txns.lock().remove(&txn);
        info!(%txn, extents = discarded.len(), "transaction rolled back");
        Ok(discarded)
    }

    /// Fine-grained rollback over an explicit block list: discard the
    /// provisional state of every extent the blocks touch. Used for partial
    /// recovery after a crash mid-batch-insert, where only some extents'
    /// blocks were written.
    ///
    /// The transaction stays open; the caller decides whether to continue,
    /// commit the remainder, or roll back fully.
    ///
    /// # Errors
    /// `LockTimeout`.
    pub fn rollback_blocks(&self, txn: TxnId, blocks: &[BlockId]) -> Result<Vec<ExtentId>> {
        let mut extents: Vec<ExtentId> = blocks.iter().map(|b| b.extent).collect();
        extents.sort_unstable();
        extents.dedup();
        self.rollback_version(txn, &extents)
    }

    /// Fine-grained rollback over an explicit extent list.
    ///
    /// # Errors
    /// `LockTimeout`.
    pub fn rollback_version(&self, txn: TxnId, extents: &[ExtentId]) -> Result<Vec<ExtentId>> {
        let _guard = self.extent_map_lock.write_for(self.lock_timeout)?;
        let mut map = self.map.lock();
        let mut discarded = Vec::new();
        for &extent in extents {
            let owned = matches!(
                map.get(extent).map(|e| e.provisional),
                Ok(Some(p)) if p.owner == txn
            );
            if owned {
                map.discard(extent, txn);
                discarded.push(extent);
            }
        }
        debug!(%txn, extents = discarded.len(), "partial rollback");
        Ok(discarded)
    }

    /// Crash cleanup: discard everything a dead transaction held and retire
    /// it. Unknown transactions are a no-op (the crash may predate any
    /// writes).
    ///
    /// # Errors
    /// `LockTimeout`.
    pub fn release_all_for_txn(&self, txn: TxnId) -> Result<usize> {
        let discarded = self.rollback(txn)?;
        Ok(discarded.len())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require_txn(&self, txn: TxnId) -> Result<()> {
        if !txn.is_valid() || !self.txns.lock().contains_key(&txn) {
            return Err(CairnError::InvalidTransactionState);
        }
        Ok(())
    }

    /// Record a published version in the VSS under the shard's named lock.
    fn publish_vss(&self, extent: ExtentId, version: VersionId) -> Result<()> {
        let shard = VersionStateStore::shard_of(extent);
        let _guard = self.vss_locks[shard].write_for(self.lock_timeout)?;
        self.vss.publish(extent, version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn brm() -> (tempfile::TempDir, BlockResolutionManager) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = LockRegistry::create(tmp.path()).unwrap();
        let brm =
            BlockResolutionManager::with_lock_timeout(&registry, Duration::from_secs(5)).unwrap();
        (tmp, brm)
    }

    #[test]
    fn end_to_end_write_commit() {
        let (_tmp, brm) = brm();
        brm.create_extent(ExtentId(1), Hwm(10)).unwrap();
        assert_eq!(brm.committed_version(ExtentId(1)).unwrap(), VersionId(1));

        let txn = brm.begin_txn(SessionId(1), UniqueId(100));
        let v = brm.begin_write(txn, ExtentId(1)).unwrap();
        assert_eq!(v, VersionId(2));

        // A concurrent reader still observes v1.
        assert_eq!(brm.committed_version(ExtentId(1)).unwrap(), VersionId(1));
        assert_eq!(brm.visible_version(ExtentId(1)), Some(VersionId(1)));

        brm.set_hwm(txn, ExtentId(1), Hwm(20)).unwrap();
        let committed = brm.commit(txn).unwrap();
        assert_eq!(committed, vec![ExtentId(1)]);

        // New readers observe v2.
        assert_eq!(brm.committed_version(ExtentId(1)).unwrap(), VersionId(2));
        assert_eq!(brm.visible_version(ExtentId(1)), Some(VersionId(2)));
        let snap = brm.snapshot(ExtentId(1)).unwrap();
        assert_eq!(snap.hwm, Hwm(20));
    }

    #[test]
    fn rollback_restores_pre_transaction_snapshot() {
        let (_tmp, brm) = brm();
        brm.create_extent(ExtentId(1), Hwm(10)).unwrap();
        let before = brm.snapshot(ExtentId(1)).unwrap();

        let txn = brm.begin_txn(SessionId(1), UniqueId(100));
        brm.begin_write(txn, ExtentId(1)).unwrap();
        brm.set_hwm(txn, ExtentId(1), Hwm(500)).unwrap();
        brm.rollback(txn).unwrap();

        assert_eq!(brm.snapshot(ExtentId(1)).unwrap(), before);
        // Transaction is retired.
        assert!(brm.begin_write(txn, ExtentId(1)).is_err());
    }

    #[test]
    fn exclusive_writer_per_extent() {
        let (_tmp, brm) = brm();
        brm.create_extent(ExtentId(1), Hwm(0)).unwrap();
        let a = brm.begin_txn(SessionId(1), UniqueId(1));
        let b = brm.begin_txn(SessionId(2), UniqueId(2));
        brm.begin_write(a, ExtentId(1)).unwrap();
        let err = brm.begin_write(b, ExtentId(1)).unwrap_err();
        assert!(matches!(err, CairnError::ExtentBusy { holder, .. } if holder == a));
    }

    #[test]
    fn rollback_blocks_restores_only_listed_extents() {
        let (_tmp, brm) = brm();
        brm.create_extent(ExtentId(1), Hwm(5)).unwrap();
        brm.create_extent(ExtentId(2), Hwm(5)).unwrap();
        let txn = brm.begin_txn(SessionId(1), UniqueId(1));
        brm.begin_write(txn, ExtentId(1)).unwrap();
        brm.begin_write(txn, ExtentId(2)).unwrap();

        // Crash recovery names only extent 1's blocks.
        let discarded = brm
            .rollback_blocks(
                txn,
                &[
                    BlockId {
                        extent: ExtentId(1),
                        offset: 6,
                    },
                    BlockId {
                        extent: ExtentId(1),
                        offset: 7,
                    },
                ],
            )
            .unwrap();
        assert_eq!(discarded, vec![ExtentId(1)]);

        // Extent 2 is still provisional under the (still-open) txn.
        let snap1 = brm.snapshot(ExtentId(1)).unwrap();
        let snap2 = brm.snapshot(ExtentId(2)).unwrap();
        assert_eq!(snap1.provisional_owner, None);
        assert_eq!(snap2.provisional_owner, Some(txn));

        // The remainder can still commit.
        assert_eq!(brm.commit(txn).unwrap(), vec![ExtentId(2)]);
    }

    #[test]
    fn concurrent_commit_and_rollback_on_disjoint_extents() {
        let (_tmp, brm) = brm();
        let brm = std::sync::Arc::new(brm);
        brm.create_extent(ExtentId(1), Hwm(0)).unwrap();
        brm.create_extent(ExtentId(2), Hwm(0)).unwrap();

        let a = brm.begin_txn(SessionId(1), UniqueId(1));
        let b = brm.begin_txn(SessionId(2), UniqueId(2));
        brm.begin_write(a, ExtentId(1)).unwrap();
        brm.begin_write(b, ExtentId(2)).unwrap();

        let brm_a = std::sync::Arc::clone(&brm);
        let brm_b = std::sync::Arc::clone(&brm);
        let ta = thread::spawn(move || brm_a.commit(a).unwrap());
        let tb = thread::spawn(move || brm_b.rollback(b).unwrap());
        ta.join().unwrap();
        tb.join().unwrap();

        // Neither observed the other's intermediate state.
        assert_eq!(brm.committed_version(ExtentId(1)).unwrap(), VersionId(2));
        assert_eq!(brm.committed_version(ExtentId(2)).unwrap(), VersionId(1));
    }

    #[test]
    fn release_all_for_unknown_txn_is_noop() {
        let (_tmp, brm) = brm();
        assert_eq!(brm.release_all_for_txn(TxnId(999)).unwrap(), 0);
    }

    #[test]
    fn delete_extent_clears_map_and_vss() {
        let (_tmp, brm) = brm();
        brm.create_extent(ExtentId(1), Hwm(0)).unwrap();
        assert_eq!(brm.visible_version(ExtentId(1)), Some(VersionId(1)));

        let txn = brm.begin_txn(SessionId(1), UniqueId(1));
        brm.begin_write(txn, ExtentId(1)).unwrap();
        assert!(matches!(
            brm.delete_extent(ExtentId(1)),
            Err(CairnError::ExtentBusy { .. })
        ));

        brm.rollback(txn).unwrap();
        brm.delete_extent(ExtentId(1)).unwrap();
        assert!(matches!(
            brm.committed_version(ExtentId(1)),
            Err(CairnError::NoSuchExtent(_))
        ));
        assert_eq!(brm.visible_version(ExtentId(1)), None);
    }

    #[test]
    fn adopted_txn_ids_never_collide_with_local_ones() {
        let (_tmp, brm) = brm();
        brm.create_extent(ExtentId(1), Hwm(0)).unwrap();

        brm.adopt_txn(TxnId(50), SessionId(7), UniqueId(70)).unwrap();
        // Idempotent re-adoption keeps the original context.
        brm.adopt_txn(TxnId(50), SessionId(8), UniqueId(80)).unwrap();
        assert_eq!(brm.txn_context(TxnId(50)).unwrap().session, SessionId(7));

        brm.begin_write(TxnId(50), ExtentId(1)).unwrap();
        let local = brm.begin_txn(SessionId(9), UniqueId(90));
        assert!(local.0 > 50);

        assert!(brm.adopt_txn(TxnId::NONE, SessionId(1), UniqueId(1)).is_err());
    }

    #[test]
    fn table_oid_bookkeeping() {
        let (_tmp, brm) = brm();
        let txn = brm.begin_txn(SessionId(1), UniqueId(1));
        brm.add_table(txn, TableOid(3001)).unwrap();
        brm.add_table(txn, TableOid(3001)).unwrap();
        let ctx = brm.txn_context(txn).unwrap();
        assert_eq!(ctx.table_oids, vec![TableOid(3001)]);
        assert!(brm.add_table(TxnId(999), TableOid(1)).is_err());
    }
}
