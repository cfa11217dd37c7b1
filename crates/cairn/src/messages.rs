//! Request/response payload codecs for the write-engine RPC surface.
//!
//! Every request payload is `opcode:u8 | session:u32 | txn:u64 |
//! unique_id:u64 | command body`; every response is `status:u8 | body`.
//! Field order and widths are frozen alongside the opcode discriminants.
//! Decoders never trust declared counts further than the bytes actually
//! present, so a truncated or hostile payload fails with `Underflow`
//! instead of a giant allocation.

use cairn_error::{CairnError, Result, StatusCode};
use cairn_net::ByteStream;
use cairn_types::{BlockId, ExtentId, Hwm, SessionId, TableOid, TxnId, UniqueId, VersionId};

use crate::opcode::WeOpcode;

/// One decoded write-engine request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeRequest {
    pub session: SessionId,
    pub txn: TxnId,
    pub unique_id: UniqueId,
    pub command: WeCommand,
}

/// Command-specific body of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeCommand {
    /// Bulk-insert rows into one extent. `blocks` are the offsets written
    /// within the extent; `rows` is the opaque row payload for the storage
    /// layer.
    BatchInsert {
        table: TableOid,
        extent: ExtentId,
        hwm: Hwm,
        blocks: Vec<u32>,
        rows: Vec<u8>,
    },
    /// Update rows in place, identified by block.
    Update {
        table: TableOid,
        blocks: Vec<BlockId>,
        rows: Vec<u8>,
    },
    /// Delete rows identified by block.
    Delete {
        table: TableOid,
        blocks: Vec<BlockId>,
    },
    Commit,
    Rollback,
    RollbackBlocks {
        blocks: Vec<BlockId>,
    },
    /// Stage the final high-water mark after a batch insert.
    BatchInsertEnd {
        extent: ExtentId,
        hwm: Hwm,
    },
    WrittenLbids,
}

impl WeCommand {
    #[must_use]
    pub const fn opcode(&self) -> WeOpcode {
        match self {
            Self::BatchInsert { .. } => WeOpcode::ProcessBatchInsert,
            Self::Update { .. } => WeOpcode::ProcessUpdate,
            Self::Delete { .. } => WeOpcode::ProcessDelete,
            Self::Commit => WeOpcode::CommitVersion,
            Self::Rollback => WeOpcode::RollbackVersion,
            Self::RollbackBlocks { .. } => WeOpcode::RollbackBlocks,
            Self::BatchInsertEnd { .. } => WeOpcode::BatchInsertEnd,
            Self::WrittenLbids => WeOpcode::GetWrittenLbids,
        }
    }
}

impl WeRequest {
    /// Serialize into `out` (appended; the stream may already hold data).
    pub fn encode(&self, out: &mut ByteStream) {
        out.put_u8(self.command.opcode().to_u8());
        out.put_u32(self.session.0);
        out.put_u64(self.txn.0);
        out.put_u64(self.unique_id.0);
        match &self.command {
            WeCommand::BatchInsert {
                table,
                extent,
                hwm,
                blocks,
                rows,
            } => {
                out.put_u32(table.0);
                out.put_u64(extent.0);
                out.put_u32(hwm.0);
                put_offsets(out, blocks);
                out.put_bytes(rows);
            }
            WeCommand::Update { table, blocks, rows } => {
                out.put_u32(table.0);
                put_blocks(out, blocks);
                out.put_bytes(rows);
            }
            WeCommand::Delete { table, blocks } => {
                out.put_u32(table.0);
                put_blocks(out, blocks);
            }
            WeCommand::Commit | WeCommand::Rollback | WeCommand::WrittenLbids => {}
            WeCommand::RollbackBlocks { blocks } => put_blocks(out, blocks),
            WeCommand::BatchInsertEnd { extent, hwm } => {
                out.put_u64(extent.0);
                out.put_u32(hwm.0);
            }
        }
    }

    /// Decode one request from a received payload.
    ///
    /// # Errors
    /// `Underflow` on truncation, `Remote` on an unknown opcode (the
    /// connection stays usable; only this message is rejected).
    pub fn decode(bs: &mut ByteStream) -> Result<Self> {
        let raw_op = bs.get_u8()?;
        let opcode = WeOpcode::from_u8(raw_op).ok_or_else(|| CairnError::Remote {
            detail: format!("unknown opcode {raw_op:#04x}"),
        })?;
        let session = SessionId(bs.get_u32()?);
        let txn = TxnId(bs.get_u64()?);
        let unique_id = UniqueId(bs.get_u64()?);
        let command = match opcode {
            WeOpcode::ProcessBatchInsert => WeCommand::BatchInsert {
                table: TableOid(bs.get_u32()?),
                extent: ExtentId(bs.get_u64()?),
                hwm: Hwm(bs.get_u32()?),
                blocks: get_offsets(bs)?,
                rows: bs.get_bytes()?,
            },
            WeOpcode::ProcessUpdate => WeCommand::Update {
                table: TableOid(bs.get_u32()?),
                blocks: get_blocks(bs)?,
                rows: bs.get_bytes()?,
            },
            WeOpcode::ProcessDelete => WeCommand::Delete {
                table: TableOid(bs.get_u32()?),
                blocks: get_blocks(bs)?,
            },
            WeOpcode::CommitVersion => WeCommand::Commit,
            WeOpcode::RollbackVersion => WeCommand::Rollback,
            WeOpcode::RollbackBlocks => WeCommand::RollbackBlocks {
                blocks: get_blocks(bs)?,
            },
            WeOpcode::BatchInsertEnd => WeCommand::BatchInsertEnd {
                extent: ExtentId(bs.get_u64()?),
                hwm: Hwm(bs.get_u32()?),
            },
            WeOpcode::GetWrittenLbids => WeCommand::WrittenLbids,
        };
        Ok(Self {
            session,
            txn,
            unique_id,
            command,
        })
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeReply {
    Empty,
    /// Provisional version taken by a write intent.
    Version(VersionId),
    /// Extents affected by a commit/rollback.
    Extents(Vec<ExtentId>),
    /// Blocks written so far by a transaction.
    Blocks(Vec<BlockId>),
}

impl WeReply {
    /// Serialize with the leading `Ok` status byte.
    pub fn encode(&self, out: &mut ByteStream) {
        out.put_u8(StatusCode::Ok.to_u8());
        match self {
            Self::Empty => out.put_u8(REPLY_EMPTY),
            Self::Version(v) => {
                out.put_u8(REPLY_VERSION);
                out.put_u64(v.0);
            }
            Self::Extents(extents) => {
                out.put_u8(REPLY_EXTENTS);
                out.put_u32(extents.len() as u32);
                for e in extents {
                    out.put_u64(e.0);
                }
            }
            Self::Blocks(blocks) => {
                out.put_u8(REPLY_BLOCKS);
                put_blocks(out, blocks);
            }
        }
    }

    /// Decode a response, consuming the status byte first. A non-`Ok`
    /// status decodes into the corresponding `CairnError`.
    ///
    /// # Errors
    /// The remote error on a non-`Ok` status, `Underflow`/`Remote` on a
    /// malformed reply.
    pub fn decode(bs: &mut ByteStream) -> Result<Self> {
        decode_status(bs)?;
        match bs.get_u8()? {
            REPLY_EMPTY => Ok(Self::Empty),
            REPLY_VERSION => Ok(Self::Version(VersionId(bs.get_u64()?))),
            REPLY_EXTENTS => {
                let count = checked_count(bs, 8)?;
                let mut extents = Vec::with_capacity(count);
                for _ in 0..count {
                    extents.push(ExtentId(bs.get_u64()?));
                }
                Ok(Self::Extents(extents))
            }
            REPLY_BLOCKS => Ok(Self::Blocks(get_blocks(bs)?)),
            tag => Err(CairnError::Remote {
                detail: format!("unknown reply tag {tag:#04x}"),
            }),
        }
    }
}

const REPLY_EMPTY: u8 = 0;
const REPLY_VERSION: u8 = 1;
const REPLY_EXTENTS: u8 = 2;
const REPLY_BLOCKS: u8 = 3;

/// Serialize an error response: status byte plus a status-specific body.
pub fn encode_error(out: &mut ByteStream, err: &CairnError) {
    let status = err.status_code();
    out.put_u8(status.to_u8());
    match (status, err) {
        (StatusCode::LockTimeout, CairnError::LockTimeout { name, waited_ms }) => {
            out.put_bytes(name.as_bytes());
            out.put_u64(*waited_ms);
        }
        (StatusCode::ExtentBusy, CairnError::ExtentBusy { extent, holder }) => {
            out.put_u64(extent.0);
            out.put_u64(holder.0);
        }
        (StatusCode::Underflow, CairnError::Underflow { needed, available }) => {
            out.put_u64(*needed as u64);
            out.put_u64(*available as u64);
        }
        (StatusCode::NotFound, CairnError::NoSuchExtent(extent)) => {
            out.put_u64(extent.0);
        }
        // The decoder re-wraps in Internal; sending the rendered form
        // would stack the prefix twice.
        (StatusCode::Internal, CairnError::Internal(msg)) => {
            out.put_bytes(msg.as_bytes());
        }
        // Everything else travels as text under its status byte.
        _ => out.put_bytes(err.to_string().as_bytes()),
    }
}

/// Consume the status byte, mapping non-`Ok` statuses back to errors.
fn decode_status(bs: &mut ByteStream) -> Result<()> {
    let raw = bs.get_u8()?;
    let status = StatusCode::from_u8(raw).ok_or_else(|| CairnError::Remote {
        detail: format!("unknown status byte {raw:#04x}"),
    })?;
    match status {
        StatusCode::Ok => Ok(()),
        StatusCode::LockTimeout => Err(CairnError::LockTimeout {
            name: String::from_utf8_lossy(&bs.get_bytes()?).into_owned(),
            waited_ms: bs.get_u64()?,
        }),
        StatusCode::ExtentBusy => Err(CairnError::ExtentBusy {
            extent: ExtentId(bs.get_u64()?),
            holder: TxnId(bs.get_u64()?),
        }),
        StatusCode::Underflow => Err(CairnError::Underflow {
            needed: bs.get_u64()? as usize,
            available: bs.get_u64()? as usize,
        }),
        StatusCode::NotFound => Err(CairnError::NoSuchExtent(ExtentId(bs.get_u64()?))),
        StatusCode::Internal => Err(CairnError::Internal(detail_text(bs)?)),
        StatusCode::Error => Err(CairnError::Remote {
            detail: detail_text(bs)?,
        }),
    }
}

fn detail_text(bs: &mut ByteStream) -> Result<String> {
    Ok(String::from_utf8_lossy(&bs.get_bytes()?).into_owned())
}

// -- list codecs --------------------------------------------------------------

fn put_blocks(out: &mut ByteStream, blocks: &[BlockId]) {
    out.put_u32(blocks.len() as u32);
    for b in blocks {
        out.put_u64(b.extent.0);
        out.put_u32(b.offset);
    }
}

fn get_blocks(bs: &mut ByteStream) -> Result<Vec<BlockId>> {
    let count = checked_count(bs, 12)?;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(BlockId {
            extent: ExtentId(bs.get_u64()?),
            offset: bs.get_u32()?,
        });
    }
    Ok(blocks)
}

fn put_offsets(out: &mut ByteStream, offsets: &[u32]) {
    out.put_u32(offsets.len() as u32);
    for o in offsets {
        out.put_u32(*o);
    }
}

fn get_offsets(bs: &mut ByteStream) -> Result<Vec<u32>> {
    let count = checked_count(bs, 4)?;
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(bs.get_u32()?);
    }
    Ok(offsets)
}

/// Read a list count and bound it by the bytes actually present, so a
/// corrupt count fails before any allocation.
fn checked_count(bs: &mut ByteStream, elem_size: usize) -> Result<usize> {
    let count = bs.get_u32()? as usize;
    let needed = count.saturating_mul(elem_size);
    if needed > bs.len() {
        return Err(CairnError::Underflow {
            needed,
            available: bs.len(),
        });
    }
    Ok(count)
}
