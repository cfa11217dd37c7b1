//! The write-engine server: accept loop, per-connection threads, and the
//! dispatch from decoded requests onto the block resolution manager.
//!
//! Each connection is serviced by one thread speaking strict
//! request/reply. A malformed request gets an error reply on the same
//! connection; the connection itself survives, since framing recovers on
//! the next magic. Worker threads exit when the peer closes or the server
//! handle is stopped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use cairn_brm::BlockResolutionManager;
use cairn_error::{CairnError, Result};
use cairn_net::{ByteStream, FramedListener, FramedSocket, ReadResult, TransportOptions};
use cairn_types::{BlockId, ExtentId, TxnId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::messages::{WeCommand, WeReply, WeRequest, encode_error};

/// Poll interval for shutdown checks in the accept and connection loops.
const LOOP_TICK: Duration = Duration::from_millis(100);

/// Shared engine state behind every connection thread.
struct EngineInner {
    manager: Arc<BlockResolutionManager>,
    /// Blocks written per open transaction, for `GetWrittenLbids` and
    /// crash recovery by the layer above.
    written: Mutex<HashMap<TxnId, Vec<BlockId>>>,
    shutdown: AtomicBool,
}

impl EngineInner {
    fn dispatch(&self, req: WeRequest) -> Result<WeReply> {
        let txn = req.txn;
        match req.command {
            WeCommand::BatchInsert {
                table,
                extent,
                hwm,
                blocks,
                rows,
            } => {
                self.manager.adopt_txn(txn, req.session, req.unique_id)?;
                self.manager.add_table(txn, table)?;
                let version = self.manager.begin_write(txn, extent)?;
                self.manager.set_hwm(txn, extent, hwm)?;
                self.record_blocks(txn, extent, &blocks);
                debug!(%txn, %extent, rows = rows.len(), blocks = blocks.len(),
                    "batch insert staged");
                Ok(WeReply::Version(version))
            }
            WeCommand::Update { table, blocks, rows } => {
                self.manager.adopt_txn(txn, req.session, req.unique_id)?;
                self.manager.add_table(txn, table)?;
                self.take_intents(txn, &blocks)?;
                debug!(%txn, rows = rows.len(), blocks = blocks.len(), "update staged");
                Ok(WeReply::Empty)
            }
            WeCommand::Delete { table, blocks } => {
                self.manager.adopt_txn(txn, req.session, req.unique_id)?;
                self.manager.add_table(txn, table)?;
                self.take_intents(txn, &blocks)?;
                debug!(%txn, blocks = blocks.len(), "delete staged");
                Ok(WeReply::Empty)
            }
            WeCommand::Commit => {
                let extents = self.manager.commit(txn)?;
                self.written.lock().remove(&txn);
                Ok(WeReply::Extents(extents))
            }
            WeCommand::Rollback => {
                let extents = self.manager.rollback(txn)?;
                self.written.lock().remove(&txn);
                Ok(WeReply::Extents(extents))
            }
            WeCommand::RollbackBlocks { blocks } => {
                let extents = self.manager.rollback_blocks(txn, &blocks)?;
                self.forget_blocks(txn, &extents);
                Ok(WeReply::Extents(extents))
            }
            WeCommand::BatchInsertEnd { extent, hwm } => {
                self.manager.set_hwm(txn, extent, hwm)?;
                Ok(WeReply::Empty)
            }
            WeCommand::WrittenLbids => {
                let blocks = self
                    .written
                    .lock()
                    .get(&txn)
                    .cloned()
                    .unwrap_or_default();
                Ok(WeReply::Blocks(blocks))
            }
        }
    }

    /// Take the write intent on every distinct extent the blocks touch,
    /// then record the blocks as written.
    fn take_intents(&self, txn: TxnId, blocks: &[BlockId]) -> Result<()> {
        let mut extents: Vec<ExtentId> = blocks.iter().map(|b| b.extent).collect();
        extents.sort_unstable();
        extents.dedup();
        for extent in extents {
            self.manager.begin_write(txn, extent)?;
        }
        let mut written = self.written.lock();
        written.entry(txn).or_default().extend_from_slice(blocks);
        Ok(())
    }

    fn record_blocks(&self, txn: TxnId, extent: ExtentId, offsets: &[u32]) {
        let mut written = self.written.lock();
        let list = written.entry(txn).or_default();
        list.extend(offsets.iter().map(|&offset| BlockId { extent, offset }));
    }

    /// Drop written-block records for extents whose provisional state was
    /// discarded.
    fn forget_blocks(&self, txn: TxnId, extents: &[ExtentId]) {
        let mut written = self.written.lock();
        if let Some(list) = written.get_mut(&txn) {
            list.retain(|b| !extents.contains(&b.extent));
        }
    }
}

/// Bound but not yet serving.
pub struct WriteEngineServer {
    listener: FramedListener,
    inner: Arc<EngineInner>,
}

impl WriteEngineServer {
    /// Bind the listener.
    ///
    /// # Errors
    /// `Io` from bind.
    pub fn bind(
        addr: &str,
        manager: Arc<BlockResolutionManager>,
        opts: TransportOptions,
    ) -> Result<Self> {
        let listener = FramedListener::bind(addr, opts)?;
        Ok(Self {
            listener,
            inner: Arc::new(EngineInner {
                manager,
                written: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// The bound address (port 0 resolves here).
    ///
    /// # Errors
    /// `Io` from the OS.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop on its own thread.
    #[must_use]
    pub fn spawn(self) -> ServerHandle {
        let inner = Arc::clone(&self.inner);
        let listener = self.listener;
        let join = thread::spawn(move || accept_loop(&listener, &inner));
        ServerHandle {
            inner: self.inner,
            join: Some(join),
        }
    }
}

fn accept_loop(listener: &FramedListener, inner: &Arc<EngineInner>) {
    info!(addr = ?listener.local_addr().ok(), "write engine serving");
    while !inner.shutdown.load(Ordering::Relaxed) {
        match listener.accept(Some(LOOP_TICK)) {
            Ok(Some(sock)) => {
                let inner = Arc::clone(inner);
                thread::spawn(move || connection_loop(sock, &inner));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
    info!("write engine stopped");
}

fn connection_loop(mut sock: FramedSocket, inner: &Arc<EngineInner>) {
    let peer = sock.peer_addr().ok();
    debug!(?peer, "connection up");
    while !inner.shutdown.load(Ordering::Relaxed) {
        let mut msg = match sock.read(Some(LOOP_TICK)) {
            Ok(ReadResult::Message(msg)) => msg,
            Ok(ReadResult::TimedOut) => continue,
            Ok(ReadResult::Closed) => break,
            Err(err) => {
                // Torn frame or corrupt payload: the stream state is gone.
                warn!(?peer, %err, "dropping connection");
                break;
            }
        };

        let reply = WeRequest::decode(&mut msg).and_then(|req| {
            debug!(?peer, opcode = ?req.command.opcode(), txn = %req.txn, "request");
            inner.dispatch(req)
        });

        let mut out = ByteStream::new();
        match &reply {
            Ok(body) => body.encode(&mut out),
            Err(err) => {
                warn!(?peer, %err, "request failed");
                encode_error(&mut out, err);
            }
        }
        if let Err(err) = sock.write(&out) {
            warn!(?peer, %err, "reply write failed");
            break;
        }
    }
    debug!(?peer, "connection down");
}

/// Running server. Stop it explicitly or let drop do it.
pub struct ServerHandle {
    inner: Arc<EngineInner>,
    join: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal shutdown and join the accept loop.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Crash cleanup entry point for the layer above: discard everything the
/// dead transaction held.
///
/// # Errors
/// `LockTimeout`.
pub fn release_dead_txn(manager: &BlockResolutionManager, txn: TxnId) -> Result<usize> {
    if !txn.is_valid() {
        return Err(CairnError::InvalidTransactionState);
    }
    manager.release_all_for_txn(txn)
}
