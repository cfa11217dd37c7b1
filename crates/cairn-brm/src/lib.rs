//! Block Resolution Manager: multi-version extent state and the
//! transaction protocol that mutates it.
//!
//! The layering is strict: [`extent_map`] and [`vss`] are pure data
//! structures, [`manager`] is the only module that touches the named locks
//! and is the only public mutation surface.

pub mod extent_map;
pub mod manager;
pub mod vss;

pub use extent_map::{ExtentEntry, ExtentMap, ExtentSnapshot, Provisional};
pub use manager::{BlockResolutionManager, DEFAULT_LOCK_TIMEOUT, TxnContext};
pub use vss::{SHARD_COUNT, VersionStateStore};
