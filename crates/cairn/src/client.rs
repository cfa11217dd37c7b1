//! The write-engine client: pooled connections, one request/reply per
//! call, and a single fresh-connection resend when the peer went away
//! between calls.
//!
//! The resend fires only when the failure proves the request never got a
//! reply slot: the socket was already dead or broke outright. A reply
//! timeout is surfaced instead of resent, because the engine may have
//! processed the request and only the reply was lost; replaying a commit
//! after its transaction retired would be reported as a state error, not
//! the success that actually happened.

use std::sync::Arc;
use std::time::Duration;

use cairn_error::{CairnError, Result};
use cairn_net::{ByteStream, ConnectionPool, ReadResult};
use cairn_types::{BlockId, ExtentId, Hwm, SessionId, TableOid, TxnId, UniqueId, VersionId};
use tracing::{debug, warn};

use crate::messages::{WeCommand, WeReply, WeRequest};

/// Default bound on waiting for a reply to one request.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Client handle for one write-engine endpoint. Cheap to clone per
/// session; the pool is shared.
#[derive(Clone)]
pub struct WriteEngineClient {
    endpoint: String,
    pool: Arc<ConnectionPool>,
    session: SessionId,
    unique_id: UniqueId,
    reply_timeout: Duration,
}

impl WriteEngineClient {
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        pool: Arc<ConnectionPool>,
        session: SessionId,
        unique_id: UniqueId,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool,
            session,
            unique_id,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    // -- operations ---------------------------------------------------------

    /// Stage a batch insert; returns the provisional version taken.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn process_batch_insert(
        &self,
        txn: TxnId,
        table: TableOid,
        extent: ExtentId,
        hwm: Hwm,
        blocks: Vec<u32>,
        rows: Vec<u8>,
    ) -> Result<VersionId> {
        match self.call(
            txn,
            WeCommand::BatchInsert {
                table,
                extent,
                hwm,
                blocks,
                rows,
            },
        )? {
            WeReply::Version(v) => Ok(v),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Stage updates for the listed blocks.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn process_update(
        &self,
        txn: TxnId,
        table: TableOid,
        blocks: Vec<BlockId>,
        rows: Vec<u8>,
    ) -> Result<()> {
        match self.call(txn, WeCommand::Update { table, blocks, rows })? {
            WeReply::Empty => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Stage deletes for the listed blocks.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn process_delete(
        &self,
        txn: TxnId,
        table: TableOid,
        blocks: Vec<BlockId>,
    ) -> Result<()> {
        match self.call(txn, WeCommand::Delete { table, blocks })? {
            WeReply::Empty => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Finish a batch insert by staging the final high-water mark.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn batch_insert_end(&self, txn: TxnId, extent: ExtentId, hwm: Hwm) -> Result<()> {
        match self.call(txn, WeCommand::BatchInsertEnd { extent, hwm })? {
            WeReply::Empty => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Commit the transaction; returns the extents published.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn commit_version(&self, txn: TxnId) -> Result<Vec<ExtentId>> {
        match self.call(txn, WeCommand::Commit)? {
            WeReply::Extents(extents) => Ok(extents),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Roll the transaction back; returns the extents discarded.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn rollback_version(&self, txn: TxnId) -> Result<Vec<ExtentId>> {
        match self.call(txn, WeCommand::Rollback)? {
            WeReply::Extents(extents) => Ok(extents),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Roll back the extents touched by an explicit block list; the
    /// transaction stays open.
    ///
    /// # Errors
    /// Remote lock/versioning errors, or transport errors after the resend.
    pub fn rollback_blocks(&self, txn: TxnId, blocks: Vec<BlockId>) -> Result<Vec<ExtentId>> {
        match self.call(txn, WeCommand::RollbackBlocks { blocks })? {
            WeReply::Extents(extents) => Ok(extents),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Every block the transaction has written so far on this engine.
    ///
    /// # Errors
    /// Remote errors, or transport errors after the resend.
    pub fn get_written_lbids(&self, txn: TxnId) -> Result<Vec<BlockId>> {
        match self.call(txn, WeCommand::WrittenLbids)? {
            WeReply::Blocks(blocks) => Ok(blocks),
            other => Err(unexpected_reply(other)),
        }
    }

    // -- transport ----------------------------------------------------------

    fn call(&self, txn: TxnId, command: WeCommand) -> Result<WeReply> {
        let req = WeRequest {
            session: self.session,
            txn,
            unique_id: self.unique_id,
            command,
        };
        match self.attempt(&req) {
            Err(err) if is_resendable(&err) => {
                // The pooled connection died between calls. One resend on a
                // fresh connection.
                warn!(endpoint = %self.endpoint, %err, "resending on fresh connection");
                self.attempt(&req)
            }
            other => other,
        }
    }

    fn attempt(&self, req: &WeRequest) -> Result<WeReply> {
        let mut conn = self.pool.get(&self.endpoint)?;
        let mut out = ByteStream::new();
        req.encode(&mut out);

        let result = (|| {
            conn.socket().write(&out)?;
            match conn.socket().read(Some(self.reply_timeout))? {
                ReadResult::Message(mut reply) => WeReply::decode(&mut reply),
                ReadResult::Closed => Err(CairnError::SocketClosed),
                ReadResult::TimedOut => Err(CairnError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no reply within the timeout",
                ))),
            }
        })();

        match &result {
            // Transport-level failures poison the connection.
            Err(
                CairnError::SocketClosed
                | CairnError::Io(_)
                | CairnError::CompressionFailure { .. }
                | CairnError::PayloadTooLarge { .. }
                | CairnError::Underflow { .. },
            ) => {
                self.pool.destroy(conn);
            }
            // Remote application errors leave the connection healthy.
            _ => {
                debug!(endpoint = %self.endpoint, "call complete");
                self.pool.release(conn);
            }
        }
        result
    }
}

/// Whether a failed attempt may be replayed on a fresh connection. A reply
/// timeout is excluded: the engine may have processed the request already,
/// so the caller must see the timeout and decide.
fn is_resendable(err: &CairnError) -> bool {
    match err {
        CairnError::SocketClosed => true,
        CairnError::Io(e) => e.kind() != std::io::ErrorKind::TimedOut,
        _ => false,
    }
}

fn unexpected_reply(reply: WeReply) -> CairnError {
    CairnError::Remote {
        detail: format!("unexpected reply body {reply:?}"),
    }
}
