//! Introspectable reader/writer lock with strict writer preference.
//!
//! Unlike `std::sync::RwLock`, this lock exposes its state for diagnostics
//! ([`RwLock::state`]) and guarantees writers cannot starve: a reader that
//! arrives while any writer is waiting queues behind that writer. The
//! counters live behind one mutex with two condvars (one per waiter class)
//! so wakeups are targeted instead of thundering.
//!
//! Key invariants:
//! - `writing` is mutually exclusive with `reading > 0`.
//! - A reader never passes a waiting writer (`readers` block while
//!   `writers_waiting > 0`).
//! - `state()` is a non-mutating advisory snapshot; it may be stale by the
//!   time the caller looks at it (benign TOCTOU, diagnostic use only).

use std::time::{Duration, Instant};

use cairn_error::{CairnError, Result};
use parking_lot::{Condvar, Mutex};

/// Snapshot of a lock's occupancy and queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockState {
    /// Number of readers currently inside the lock.
    pub reading: u32,
    /// Whether a writer currently holds the lock.
    pub writing: bool,
    /// Readers blocked waiting to enter.
    pub readers_waiting: u32,
    /// Writers blocked waiting to enter.
    pub writers_waiting: u32,
    /// Whether the internal mutex was held when the snapshot was taken.
    pub mutex_locked: bool,
}

#[derive(Debug, Default)]
struct Counters {
    reading: u32,
    writing: bool,
    readers_waiting: u32,
    writers_waiting: u32,
}

/// A named reader/writer lock: many readers or one writer, writer-preferring.
#[derive(Debug)]
pub struct RwLock {
    name: String,
    counters: Mutex<Counters>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl RwLock {
    /// Create an unheld lock. `name` appears in timeout errors and logs.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: Mutex::new(Counters::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
        }
    }

    /// The diagnostic name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a read lock is held.
    pub fn acquire_read(&self) {
        let mut c = self.counters.lock();
        while c.writing || c.writers_waiting > 0 {
            c.readers_waiting += 1;
            self.readers_cv.wait(&mut c);
            c.readers_waiting -= 1;
        }
        c.reading += 1;
    }

    /// Block until a write lock is held.
    pub fn acquire_write(&self) {
        let mut c = self.counters.lock();
        while c.writing || c.reading > 0 {
            c.writers_waiting += 1;
            self.writers_cv.wait(&mut c);
            c.writers_waiting -= 1;
        }
        c.writing = true;
    }

    /// Acquire a read lock, giving up after `timeout`.
    ///
    /// # Errors
    /// Returns [`CairnError::LockTimeout`] if the deadline passes first.
    pub fn try_acquire_read_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut c = self.counters.lock();
        while c.writing || c.writers_waiting > 0 {
            c.readers_waiting += 1;
            let timed_out = self.readers_cv.wait_until(&mut c, deadline).timed_out();
            c.readers_waiting -= 1;
            if timed_out && (c.writing || c.writers_waiting > 0) {
                return Err(self.timeout_err(timeout));
            }
        }
        c.reading += 1;
        Ok(())
    }

    /// Acquire a write lock, giving up after `timeout`.
    ///
    /// # Errors
    /// Returns [`CairnError::LockTimeout`] if the deadline passes first.
    pub fn try_acquire_write_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut c = self.counters.lock();
        while c.writing || c.reading > 0 {
            c.writers_waiting += 1;
            let timed_out = self.writers_cv.wait_until(&mut c, deadline).timed_out();
            c.writers_waiting -= 1;
            if timed_out && (c.writing || c.reading > 0) {
                return Err(self.timeout_err(timeout));
            }
        }
        c.writing = true;
        Ok(())
    }

    /// Release a read lock previously acquired on this object.
    ///
    /// # Panics
    /// Panics if no read lock is held (a release without acquire is a caller
    /// bug, not a recoverable condition).
    pub fn release_read(&self) {
        let mut c = self.counters.lock();
        assert!(c.reading > 0, "release_read without a held read lock");
        c.reading -= 1;
        if c.reading == 0 && c.writers_waiting > 0 {
            self.writers_cv.notify_one();
        }
    }

    /// Release the write lock previously acquired on this object.
    ///
    /// # Panics
    /// Panics if no write lock is held.
    pub fn release_write(&self) {
        let mut c = self.counters.lock();
        assert!(c.writing, "release_write without a held write lock");
        c.writing = false;
        if c.writers_waiting > 0 {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
    }

    /// RAII read acquisition.
    pub fn read(&self) -> ReadGuard<'_> {
        self.acquire_read();
        ReadGuard { lock: self }
    }

    /// RAII write acquisition.
    pub fn write(&self) -> WriteGuard<'_> {
        self.acquire_write();
        WriteGuard { lock: self }
    }

    /// RAII timed read acquisition.
    ///
    /// # Errors
    /// Returns [`CairnError::LockTimeout`] if the deadline passes first.
    pub fn read_for(&self, timeout: Duration) -> Result<ReadGuard<'_>> {
        self.try_acquire_read_for(timeout)?;
        Ok(ReadGuard { lock: self })
    }

    /// RAII timed write acquisition.
    ///
    /// # Errors
    /// Returns [`CairnError::LockTimeout`] if the deadline passes first.
    pub fn write_for(&self, timeout: Duration) -> Result<WriteGuard<'_>> {
        self.try_acquire_write_for(timeout)?;
        Ok(WriteGuard { lock: self })
    }

    /// Advisory snapshot of the lock state.
    ///
    /// `mutex_locked` reports whether the internal mutex was contended at
    /// the moment of the call; the counter values are read after it is
    /// released by the other party, so they are consistent with each other
    /// but may be stale.
    #[must_use]
    pub fn state(&self) -> LockState {
        let (c, was_locked) = match self.counters.try_lock() {
            Some(g) => (g, false),
            None => (self.counters.lock(), true),
        };
        LockState {
            reading: c.reading,
            writing: c.writing,
            readers_waiting: c.readers_waiting,
            writers_waiting: c.writers_waiting,
            mutex_locked: was_locked,
        }
    }

    fn timeout_err(&self, waited: Duration) -> CairnError {
        CairnError::LockTimeout {
            name: self.name.clone(),
            waited_ms: waited.as_millis() as u64,
        }
    }
}

/// RAII guard for a held read lock.
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII guard for a held write lock.
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
