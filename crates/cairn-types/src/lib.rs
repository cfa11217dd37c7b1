//! Core identifier types shared across the CairnStore engine crates.
//!
//! Every id that crosses a process or wire boundary is a newtype here, so a
//! `TxnId` can never be passed where an `ExtentId` is expected. Sentinel
//! conventions (0 = "none") are documented on each type rather than spread
//! through call sites.

pub mod encoding;

use std::fmt;

/// A client session identifier assigned by the SQL-facing front end.
///
/// Sessions outlive transactions: one session runs many transactions, one at
/// a time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A transaction identifier.
///
/// `TxnId(0)` is the sentinel for "no transaction" and is never assigned to a
/// live transaction; the BRM rejects it at the API boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(pub u64);

impl TxnId {
    /// The "no transaction" sentinel.
    pub const NONE: Self = Self(0);

    /// Whether this is a real (non-sentinel) transaction id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// A process-unique request id used to correlate an RPC response with its
/// request across the transport.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct UniqueId(pub u64);

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid-{}", self.0)
    }
}

/// A table object id from the system catalog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableOid(pub u32);

impl fmt::Display for TableOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid-{}", self.0)
    }
}

/// An extent identifier: a contiguous range of blocks for one column, the
/// unit of allocation, versioning, and write locking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ExtentId(pub u64);

impl fmt::Display for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "extent-{}", self.0)
    }
}

/// A monotonically increasing per-extent version number.
///
/// Versions never decrease. Publishing version V on an extent already at
/// version V is a no-op, which is what makes commit retry idempotent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct VersionId(pub u64);

impl VersionId {
    /// The initial committed version of a freshly created extent.
    pub const INITIAL: Self = Self(1);

    /// The next version in sequence.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// High-water mark: the highest written block offset within an extent.
///
/// New writes append at `hwm + 1`. Rollback restores the pre-transaction
/// HWM so partially written blocks become unreachable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Hwm(pub u32);

impl fmt::Display for Hwm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hwm-{}", self.0)
    }
}

/// A single block address: an extent plus a block offset within it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct BlockId {
    pub extent: ExtentId,
    pub offset: u32,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.extent, self.offset)
    }
}
