//! Engine configuration: JSON on disk, serde in memory.
//!
//! One file describes everything a node needs to join the cluster: the
//! named write-engine endpoints, transport knobs, pool bounds, and the
//! directory holding the named-lock registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cairn_error::{CairnError, Result};
use cairn_net::{PoolConfig, TransportOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Logical endpoint name → `host:port`.
    pub endpoints: BTreeMap<String, String>,
    /// Directory holding the named-lock key files.
    pub lock_dir: PathBuf,
    /// Whether frames to non-loopback peers may be compressed.
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Whether accept/connect exchange the synchronization byte.
    #[serde(default)]
    pub sync_protocol: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    /// Pooled connections idle longer than this are evicted.
    #[serde(default = "default_pool_max_idle_secs")]
    pub pool_max_idle_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_reply_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_secs() -> u64 {
    300
}

impl EngineConfig {
    /// Parse from a JSON string.
    ///
    /// # Errors
    /// `Internal` with the serde detail on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CairnError::internal(format!("bad engine config: {e}")))
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// `Io` on read failure, `Internal` on malformed content.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Resolve a named endpoint.
    ///
    /// # Errors
    /// `EndpointUnreachable` for an unknown name.
    pub fn endpoint(&self, name: &str) -> Result<&str> {
        self.endpoints
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| CairnError::EndpointUnreachable {
                endpoint: name.to_owned(),
            })
    }

    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            compress: self.compression,
            sync_protocol: self.sync_protocol,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle: Duration::from_secs(self.pool_max_idle_secs),
            transport: self.transport_options(),
        }
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let cfg = EngineConfig::from_json(
            r#"{
                "endpoints": { "we1": "10.0.0.5:8630" },
                "lock_dir": "/var/lib/cairn/locks"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.endpoint("we1").unwrap(), "10.0.0.5:8630");
        assert!(cfg.compression);
        assert!(!cfg.sync_protocol);
        assert_eq!(cfg.pool_config().max_idle, Duration::from_secs(300));
        assert_eq!(
            cfg.transport_options().connect_timeout,
            Duration::from_secs(20)
        );
        assert_eq!(cfg.reply_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn overrides_and_round_trip() {
        let cfg = EngineConfig::from_json(
            r#"{
                "endpoints": { "we1": "a:1", "we2": "b:2" },
                "lock_dir": "/tmp/locks",
                "compression": false,
                "sync_protocol": true,
                "pool_max_idle_secs": 60
            }"#,
        )
        .unwrap();
        assert!(!cfg.compression);
        assert!(cfg.sync_protocol);
        assert_eq!(cfg.pool_config().max_idle, Duration::from_secs(60));

        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), cfg);
    }

    #[test]
    fn unknown_endpoint_name_errors() {
        let cfg = EngineConfig::from_json(
            r#"{ "endpoints": {}, "lock_dir": "/tmp/locks" }"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.endpoint("nope"),
            Err(CairnError::EndpointUnreachable { .. })
        ));
    }

    #[test]
    fn malformed_json_is_internal_error() {
        assert!(matches!(
            EngineConfig::from_json("{"),
            Err(CairnError::Internal(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{ "endpoints": { "we1": "127.0.0.1:1" }, "lock_dir": "/tmp/l" }"#,
        )
        .unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.endpoint("we1").unwrap(), "127.0.0.1:1");
    }
}
