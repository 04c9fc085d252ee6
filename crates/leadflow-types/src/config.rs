//! Engine configuration types for Leadflow.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! stale-step timeouts, run-lease timing, and the global pause switch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the pipeline engine.
///
/// Loaded from `~/.leadflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A running step older than this is considered dead and force-failed.
    #[serde(default = "default_stale_step_timeout_secs")]
    pub stale_step_timeout_secs: u64,

    /// Extended timeout for a SENDER step that has not yet recorded a handoff job.
    #[serde(default = "default_sender_stale_timeout_secs")]
    pub sender_stale_timeout_secs: u64,

    /// Lifetime of a run/lead lease before another caller may take it over.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// How long a caller blocks waiting for a held lease.
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,

    /// Poll interval while waiting for a lease.
    #[serde(default = "default_lease_poll_ms")]
    pub lease_poll_ms: u64,

    /// When set, `run_next` returns immediately without touching state.
    #[serde(default)]
    pub paused: bool,
}

fn default_stale_step_timeout_secs() -> u64 {
    15 * 60
}

fn default_sender_stale_timeout_secs() -> u64 {
    60 * 60
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_lease_wait_ms() -> u64 {
    10_000
}

fn default_lease_poll_ms() -> u64 {
    25
}

impl EngineConfig {
    pub fn stale_step_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_step_timeout_secs)
    }

    pub fn sender_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.sender_stale_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }

    pub fn lease_poll(&self) -> Duration {
        Duration::from_millis(self.lease_poll_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_step_timeout_secs: default_stale_step_timeout_secs(),
            sender_stale_timeout_secs: default_sender_stale_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            lease_wait_ms: default_lease_wait_ms(),
            lease_poll_ms: default_lease_poll_ms(),
            paused: false,
        }
    }
}
