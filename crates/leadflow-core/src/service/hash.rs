//! Settings fingerprinting port.
//!
//! The planner records a digest of each campaign's shared settings in the
//! run snapshot so snapshots can be compared across runs. The SHA-256
//! adapter lives in leadflow-infra.

use serde_json::Value;

/// Fingerprints a settings document.
///
/// Implementations must hash a canonical form so that two documents that
/// differ only in key order produce the same digest.
pub trait SettingsHasher: Send + Sync {
    fn hash_settings(&self, settings: &Value) -> String;
}
