//! SHA-256 fingerprints of campaign settings.

use leadflow_core::pipeline::settings::canonical_json;
use leadflow_core::service::hash::SettingsHasher;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hashes the canonical JSON (recursively sorted keys, no whitespace) of a
/// settings document as lowercase hex SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256SettingsHasher;

impl Sha256SettingsHasher {
    pub fn new() -> Self {
        Self
    }
}

impl SettingsHasher for Sha256SettingsHasher {
    fn hash_settings(&self, settings: &Value) -> String {
        let digest = Sha256::digest(canonical_json(settings).as_bytes());
        format!("{digest:x}")
    }
}
