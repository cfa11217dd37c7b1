//! Process-local pool of client connections, keyed by endpoint.
//!
//! The pool exclusively owns idle connections; a borrowed connection moves
//! out to the caller inside a [`PooledConnection`] and comes back through
//! [`ConnectionPool::release`] (healthy) or [`ConnectionPool::destroy`]
//! (protocol violation — the socket must never be reused). Bookkeeping for
//! a borrowed connection stays in the map under `in_use`, so the eviction
//! scan can see it and leave it alone.
//!
//! There is no background sweeper: every `get` and `release` runs an
//! opportunistic scan that drops idle entries older than `max_idle` and
//! entries that fail the liveness probe. A socket with unread pending
//! bytes is desynchronized and is dropped even if recently used. The map
//! mutex is held for bookkeeping only — connects, probes, and I/O all
//! happen outside it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cairn_error::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::socket::{FramedSocket, Liveness, TransportOptions};

/// Idle connections older than this are evicted at the next scan.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(300);

/// Pool tunables.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_idle: Duration,
    pub transport: TransportOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            transport: TransportOptions::default(),
        }
    }
}

/// A borrowed connection. Every borrow must go back through
/// [`ConnectionPool::release`] or [`ConnectionPool::destroy`]: in-use
/// entries are exempt from eviction, so dropping the handle without
/// either closes the socket but leaves its bookkeeping entry accounted
/// as in-use indefinitely.
#[derive(Debug)]
pub struct PooledConnection {
    endpoint: String,
    id: u64,
    socket: FramedSocket,
}

impl PooledConnection {
    /// The endpoint key this connection belongs to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The framed socket itself.
    pub fn socket(&mut self) -> &mut FramedSocket {
        &mut self.socket
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    /// `Some` while idle in the pool, `None` while borrowed.
    socket: Option<FramedSocket>,
    last_used: Instant,
    in_use: bool,
}

/// Endpoint → connections multimap with opportunistic eviction.
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: Mutex<u64>,
    config: PoolConfig,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            config,
        }
    }

    /// Borrow a connection to `endpoint`, creating one if no healthy idle
    /// connection exists. Runs the eviction scan first.
    ///
    /// # Errors
    /// `EndpointUnreachable` if a fresh connection cannot be established.
    pub fn get(&self, endpoint: &str) -> Result<PooledConnection> {
        self.get_at(endpoint, Instant::now())
    }

    /// As [`ConnectionPool::get`] with an explicit scan timestamp.
    ///
    /// # Errors
    /// `EndpointUnreachable` if a fresh connection cannot be established.
    pub fn get_at(&self, endpoint: &str, now: Instant) -> Result<PooledConnection> {
        // Phase 1 (bookkeeping under the mutex): evict by age, pull idle
        // candidates out for probing.
        let candidates = {
            let mut entries = self.entries.lock();
            self.evict_stale(&mut entries, now);
            let mut pulled = Vec::new();
            if let Some(list) = entries.get_mut(endpoint) {
                for entry in list.iter_mut() {
                    if !entry.in_use {
                        if let Some(socket) = entry.socket.take() {
                            entry.in_use = true;
                            pulled.push((entry.id, socket));
                        }
                    }
                }
            }
            pulled
        };

        // Phase 2 (no mutex): probe candidates. First healthy one wins;
        // broken ones are discarded, the rest go back.
        let mut winner: Option<(u64, FramedSocket)> = None;
        let mut healthy_returns = Vec::new();
        let mut broken = Vec::new();
        for (id, socket) in candidates {
            if winner.is_some() {
                healthy_returns.push((id, socket));
                continue;
            }
            match socket.probe() {
                Liveness::Idle => winner = Some((id, socket)),
                Liveness::PendingData => {
                    warn!(endpoint, id, "evicting connection with unexpected pending data");
                    broken.push(id);
                }
                Liveness::Dead => {
                    debug!(endpoint, id, "evicting dead connection");
                    broken.push(id);
                }
            }
        }

        {
            let mut entries = self.entries.lock();
            if let Some(list) = entries.get_mut(endpoint) {
                list.retain(|e| !broken.contains(&e.id));
                for (id, socket) in healthy_returns {
                    if let Some(entry) = list.iter_mut().find(|e| e.id == id) {
                        entry.socket = Some(socket);
                        entry.in_use = false;
                    }
                }
            }
            if let Some((id, socket)) = winner {
                return Ok(PooledConnection {
                    endpoint: endpoint.to_owned(),
                    id,
                    socket,
                });
            }
        }

        // Phase 3 (no mutex): no reusable connection — dial a new one.
        let socket = FramedSocket::connect(endpoint, self.config.transport)?;
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let mut entries = self.entries.lock();
        entries.entry(endpoint.to_owned()).or_default().push(Entry {
            id,
            socket: None,
            last_used: now,
            in_use: true,
        });
        info!(endpoint, id, "created pooled connection");
        Ok(PooledConnection {
            endpoint: endpoint.to_owned(),
            id,
            socket,
        })
    }

    /// Return a healthy connection to the pool and run the eviction scan.
    pub fn release(&self, conn: PooledConnection) {
        self.release_at(conn, Instant::now());
    }

    /// As [`ConnectionPool::release`] with an explicit timestamp.
    pub fn release_at(&self, conn: PooledConnection, now: Instant) {
        let mut entries = self.entries.lock();
        if let Some(list) = entries.get_mut(&conn.endpoint) {
            if let Some(entry) = list.iter_mut().find(|e| e.id == conn.id) {
                entry.socket = Some(conn.socket);
                entry.in_use = false;
                entry.last_used = now;
            }
        }
        self.evict_stale(&mut entries, now);
    }

    /// Force-remove a connection after a protocol-level error; it is closed
    /// and never handed out again.
    pub fn destroy(&self, conn: PooledConnection) {
        conn.socket.shutdown();
        let mut entries = self.entries.lock();
        if let Some(list) = entries.get_mut(&conn.endpoint) {
            list.retain(|e| e.id != conn.id);
        }
        info!(endpoint = %conn.endpoint, id = conn.id, "destroyed pooled connection");
    }

    /// Idle connection count for an endpoint (diagnostics and tests).
    #[must_use]
    pub fn idle_count(&self, endpoint: &str) -> usize {
        self.entries
            .lock()
            .get(endpoint)
            .map_or(0, |list| list.iter().filter(|e| !e.in_use).count())
    }

    /// Total tracked connections for an endpoint, borrowed ones included.
    #[must_use]
    pub fn total_count(&self, endpoint: &str) -> usize {
        self.entries.lock().get(endpoint).map_or(0, Vec::len)
    }

    /// Drop entries idle beyond `max_idle`. In-use entries are never
    /// touched regardless of age.
    fn evict_stale(&self, entries: &mut HashMap<String, Vec<Entry>>, now: Instant) {
        for (endpoint, list) in entries.iter_mut() {
            list.retain(|e| {
                let stale = !e.in_use
                    && now.saturating_duration_since(e.last_used) > self.config.max_idle;
                if stale {
                    debug!(endpoint = %endpoint, id = e.id, "evicting idle connection");
                }
                !stale
            });
        }
        entries.retain(|_, list| !list.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::FramedListener;
    use cairn_error::CairnError;
    use std::thread;

    /// Accept loop that keeps every accepted socket alive until the
    /// listener handle is dropped.
    fn server() -> (String, thread::JoinHandle<()>, std::sync::mpsc::Sender<()>) {
        let listener = FramedListener::bind("127.0.0.1:0", TransportOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let mut held = Vec::new();
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                if let Ok(Some(sock)) = listener.accept(Some(Duration::from_millis(50))) {
                    held.push(sock);
                }
            }
        });
        (addr, handle, stop_tx)
    }

    fn pool_with_idle(max_idle: Duration) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_idle,
            transport: TransportOptions::default(),
        })
    }

    #[test]
    fn get_release_reuses_connection() {
        let (addr, handle, stop) = server();
        let pool = pool_with_idle(DEFAULT_MAX_IDLE);

        let conn = pool.get(&addr).unwrap();
        assert_eq!(pool.total_count(&addr), 1);
        assert_eq!(pool.idle_count(&addr), 0);
        pool.release(conn);
        assert_eq!(pool.idle_count(&addr), 1);

        let again = pool.get(&addr).unwrap();
        assert_eq!(pool.total_count(&addr), 1, "idle connection was reused");
        pool.release(again);

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn stale_idle_connection_is_evicted() {
        let (addr, handle, stop) = server();
        let pool = pool_with_idle(Duration::from_secs(300));

        let conn = pool.get(&addr).unwrap();
        // Release with a timestamp from the distant past.
        let long_ago = Instant::now() - Duration::from_secs(301);
        pool.release_at(conn, long_ago);
        assert_eq!(pool.idle_count(&addr), 1);

        // The next scan drops it and dials fresh.
        let fresh = pool.get(&addr).unwrap();
        assert_eq!(pool.total_count(&addr), 1);
        pool.release(fresh);
        assert_eq!(pool.idle_count(&addr), 1);

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn in_use_connection_is_never_evicted() {
        let (addr, handle, stop) = server();
        let pool = pool_with_idle(Duration::from_millis(1));

        let conn = pool.get(&addr).unwrap();
        // Scans far in the future must not touch the borrowed entry.
        let _ = pool.get_at(&addr, Instant::now() + Duration::from_secs(600));
        assert!(pool.total_count(&addr) >= 1);
        pool.release(conn);

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn dead_connection_is_discarded_on_get() {
        let (addr, handle, stop) = server();
        let pool = pool_with_idle(DEFAULT_MAX_IDLE);

        let conn = pool.get(&addr).unwrap();
        conn.socket.shutdown();
        pool.release(conn);
        assert_eq!(pool.idle_count(&addr), 1);

        // get() probes, discards the dead socket, and dials a new one.
        let fresh = pool.get(&addr).unwrap();
        assert_eq!(pool.total_count(&addr), 1);
        pool.release(fresh);

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn destroy_removes_entry() {
        let (addr, handle, stop) = server();
        let pool = pool_with_idle(DEFAULT_MAX_IDLE);

        let conn = pool.get(&addr).unwrap();
        pool.destroy(conn);
        assert_eq!(pool.total_count(&addr), 0);

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn unreachable_endpoint_errors() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle: DEFAULT_MAX_IDLE,
            transport: TransportOptions {
                connect_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        });
        // Reserved TEST-NET address: nothing listens there.
        let err = pool.get("192.0.2.1:9").unwrap_err();
        assert!(matches!(err, CairnError::EndpointUnreachable { .. }));
    }
}
