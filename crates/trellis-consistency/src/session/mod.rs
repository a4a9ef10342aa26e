//! Client sessions
//!
//! Sessions give clients exactly-once command semantics: every command
//! carries a per-session sequence number, results are cached until the client
//! acknowledges them, and a session that stops sending keep-alives is expired
//! deterministically from entry timestamps.

pub mod manager;
pub mod model;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use manager::SessionManager;
pub use model::{CachedResult, SequenceCheck, Session};

/// Session timing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session timeout requested by clients (default: 5000ms)
    pub timeout_ms: u64,

    /// Client keep-alive period (default: 1000ms)
    pub keep_alive_interval_ms: u64,

    /// How often the leader scans for stale sessions (default: 500ms)
    pub expiry_check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            keep_alive_interval_ms: 1000,
            expiry_check_interval_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms.max(1))
    }
}
