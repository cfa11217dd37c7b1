//! The extent map: per-extent committed version, HWM, and provisional state.
//!
//! Pure data. All concurrency control lives in the manager, which brackets
//! every access with the named extent-map lock; nothing here blocks.
//!
//! Per-extent state machine:
//!
//! ```text
//! Committed(V) --begin_write(T)--> Provisional(V+1, T)
//! Provisional(V+1, T) --publish--> Committed(V+1)
//! Provisional(V+1, T) --discard--> Committed(V)   (HWM restored)
//! ```
//!
//! Versions are monotonically increasing per extent, which is what makes
//! commit retry idempotent: publishing a version the extent already carries
//! is a no-op.

use std::collections::HashMap;

use cairn_error::{CairnError, Result};
use cairn_types::{ExtentId, Hwm, TxnId, VersionId};

/// Uncommitted state staged by one transaction on one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provisional {
    /// The version that becomes committed if the owner commits.
    pub version: VersionId,
    /// The transaction holding the write intent.
    pub owner: TxnId,
    /// HWM staged by the writer (starts at the committed HWM).
    pub staged_hwm: Hwm,
}

/// One extent's entry in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentEntry {
    /// The committed, reader-visible version.
    pub committed: VersionId,
    /// The committed HWM: highest written block offset.
    pub hwm: Hwm,
    /// In-flight provisional write, if any.
    pub provisional: Option<Provisional>,
}

/// Reader-visible snapshot of an extent, used for diagnostics and recovery
/// verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentSnapshot {
    pub committed: VersionId,
    pub hwm: Hwm,
    pub provisional_owner: Option<TxnId>,
}

/// The extent map proper.
#[derive(Debug, Default)]
pub struct ExtentMap {
    entries: HashMap<ExtentId, ExtentEntry>,
}

impl ExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new extent at [`VersionId::INITIAL`] with the given HWM.
    ///
    /// # Errors
    /// `Internal` if the extent already exists (allocation handed out the
    /// same id twice).
    pub fn insert(&mut self, extent: ExtentId, hwm: Hwm) -> Result<()> {
        if self.entries.contains_key(&extent) {
            return Err(CairnError::internal(format!("duplicate extent {extent}")));
        }
        self.entries.insert(
            extent,
            ExtentEntry {
                committed: VersionId::INITIAL,
                hwm,
                provisional: None,
            },
        );
        Ok(())
    }

    /// Look up an entry.
    ///
    /// # Errors
    /// `NoSuchExtent` if absent.
    pub fn get(&self, extent: ExtentId) -> Result<&ExtentEntry> {
        self.entries
            .get(&extent)
            .ok_or(CairnError::NoSuchExtent(extent))
    }

    fn get_mut(&mut self, extent: ExtentId) -> Result<&mut ExtentEntry> {
        self.entries
            .get_mut(&extent)
            .ok_or(CairnError::NoSuchExtent(extent))
    }

    /// Take a write intent: `Committed(V)` → `Provisional(V+1, owner)`.
    ///
    /// Idempotent for the same owner (returns the existing provisional
    /// version).
    ///
    /// # Errors
    /// `ExtentBusy` if a different transaction holds the intent;
    /// `NoSuchExtent` if absent.
    pub fn begin_write(&mut self, extent: ExtentId, owner: TxnId) -> Result<VersionId> {
        let entry = self.get_mut(extent)?;
        if let Some(p) = entry.provisional {
            if p.owner == owner {
                return Ok(p.version);
            }
            return Err(CairnError::ExtentBusy {
                extent,
                holder: p.owner,
            });
        }
        let version = entry.committed.next();
        entry.provisional = Some(Provisional {
            version,
            owner,
            staged_hwm: entry.hwm,
        });
        Ok(version)
    }

    /// Stage a new HWM on a provisional extent owned by `owner`.
    ///
    /// # Errors
    /// `InvalidTransactionState` if the extent is not provisional under
    /// `owner`.
    pub fn stage_hwm(&mut self, extent: ExtentId, owner: TxnId, hwm: Hwm) -> Result<()> {
        let entry = self.get_mut(extent)?;
        match entry.provisional.as_mut() {
            Some(p) if p.owner == owner => {
                p.staged_hwm = hwm;
                Ok(())
            }
            _ => Err(CairnError::InvalidTransactionState),
        }
    }

    /// Publish the provisional version owned by `owner`: the committed
    /// version pointer swaps to the provisional one and the staged HWM
    /// becomes committed.
    ///
    /// Idempotent: if there is no provisional state but the committed
    /// version already reached `expected` (a prior publish that the caller
    /// is retrying), this is a no-op returning the committed version.
    ///
    /// # Errors
    /// `ExtentBusy` if another transaction owns the intent;
    /// `VersionMismatch` if there is no intent and the committed version
    /// never reached `expected` (the intent was discarded out from under
    /// the caller).
    pub fn publish(
        &mut self,
        extent: ExtentId,
        owner: TxnId,
        expected: VersionId,
    ) -> Result<VersionId> {
        let entry = self.get_mut(extent)?;
        match entry.provisional {
            Some(p) if p.owner == owner => {
                entry.committed = p.version;
                entry.hwm = p.staged_hwm;
                entry.provisional = None;
                Ok(entry.committed)
            }
            Some(p) => Err(CairnError::ExtentBusy {
                extent,
                holder: p.owner,
            }),
            // Retried publish after a partial commit: already at (or past)
            // the expected version means the earlier attempt landed.
            None if entry.committed >= expected => Ok(entry.committed),
            None => Err(CairnError::VersionMismatch {
                extent,
                expected,
                actual: entry.committed,
            }),
        }
    }

    /// Discard the provisional state owned by `owner`, restoring the prior
    /// committed version and HWM. No-op if the extent is not provisional
    /// under `owner` (safe after a partially successful commit).
    pub fn discard(&mut self, extent: ExtentId, owner: TxnId) {
        if let Some(entry) = self.entries.get_mut(&extent) {
            if matches!(entry.provisional, Some(p) if p.owner == owner) {
                entry.provisional = None;
            }
        }
    }

    /// Remove an extent entirely (deallocation after a table drop).
    ///
    /// # Errors
    /// `ExtentBusy` while a provisional write is in flight; `NoSuchExtent`
    /// if absent.
    pub fn remove(&mut self, extent: ExtentId) -> Result<()> {
        let entry = self.get(extent)?;
        if let Some(p) = entry.provisional {
            return Err(CairnError::ExtentBusy {
                extent,
                holder: p.owner,
            });
        }
        self.entries.remove(&extent);
        Ok(())
    }

    /// All extents currently provisional under `owner`.
    #[must_use]
    pub fn provisional_extents(&self, owner: TxnId) -> Vec<ExtentId> {
        let mut extents: Vec<ExtentId> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.provisional, Some(p) if p.owner == owner))
            .map(|(id, _)| *id)
            .collect();
        extents.sort_unstable();
        extents
    }

    /// Diagnostic snapshot of one extent.
    ///
    /// # Errors
    /// `NoSuchExtent` if absent.
    pub fn snapshot(&self, extent: ExtentId) -> Result<ExtentSnapshot> {
        let entry = self.get(extent)?;
        Ok(ExtentSnapshot {
            committed: entry.committed,
            hwm: entry.hwm,
            provisional_owner: entry.provisional.map(|p| p.owner),
        })
    }
}
