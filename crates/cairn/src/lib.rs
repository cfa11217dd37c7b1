//! CairnStore write-engine RPC surface.
//!
//! Ties the lower crates together: requests framed by `cairn-net`, lock
//! and version state from `cairn-brm`, errors and status bytes from
//! `cairn-error`. A node runs one [`WriteEngineServer`] over its local
//! [`cairn_brm::BlockResolutionManager`]; peers drive it through
//! [`WriteEngineClient`] handles sharing a [`cairn_net::ConnectionPool`].

pub mod client;
pub mod config;
pub mod messages;
pub mod opcode;
pub mod server;

pub use client::{WriteEngineClient, DEFAULT_REPLY_TIMEOUT};
pub use config::EngineConfig;
pub use messages::{WeCommand, WeReply, WeRequest};
pub use opcode::WeOpcode;
pub use server::{ServerHandle, WriteEngineServer, release_dead_txn};
