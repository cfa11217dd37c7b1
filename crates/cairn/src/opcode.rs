//! Write-engine RPC opcodes.
//!
//! Wire discriminants are frozen: peers across a cluster upgrade at
//! different times, so renumbering is a protocol break.

/// Command byte leading every write-engine request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WeOpcode {
    /// Bulk-insert a batch of rows into one extent.
    ProcessBatchInsert = 1,
    /// Update rows identified by block.
    ProcessUpdate = 2,
    /// Delete rows identified by block.
    ProcessDelete = 3,
    /// Publish every extent the transaction holds provisionally.
    CommitVersion = 4,
    /// Discard every provisional extent and retire the transaction.
    RollbackVersion = 5,
    /// Discard provisional state for an explicit block list; the
    /// transaction stays open.
    RollbackBlocks = 6,
    /// Finish a batch insert: stage the final high-water mark.
    BatchInsertEnd = 7,
    /// Report every block the transaction has written so far.
    GetWrittenLbids = 8,
}

impl WeOpcode {
    /// Wire discriminant value.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse wire discriminant; `None` for unknown opcodes.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ProcessBatchInsert),
            2 => Some(Self::ProcessUpdate),
            3 => Some(Self::ProcessDelete),
            4 => Some(Self::CommitVersion),
            5 => Some(Self::RollbackVersion),
            6 => Some(Self::RollbackBlocks),
            7 => Some(Self::BatchInsertEnd),
            8 => Some(Self::GetWrittenLbids),
            _ => None,
        }
    }
}
