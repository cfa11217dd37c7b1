//! Named reader/writer locking for the CairnStore BRM.
//!
//! Two layers: [`rwlock`] is the introspectable writer-preferring lock
//! primitive, [`table`] is the fixed enumeration of engine lock names with
//! their deterministic key layout, the process-wide registry, and the
//! administrative sweep.

pub mod rwlock;
pub mod table;

pub use rwlock::{LockState, ReadGuard, RwLock, WriteGuard};
pub use table::{
    KEY_RANGE, LockKey, LockName, LockRegistry, SweepOptions, SweepReport, VSS_SHARDS, sweep,
};
