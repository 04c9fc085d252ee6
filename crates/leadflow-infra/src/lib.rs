//! Infrastructure layer for Leadflow.
//!
//! Contains implementations of the repository traits defined in `leadflow-core`:
//! SQLite storage, SHA-256 settings hashing, and the engine config loader.

pub mod config;
pub mod crypto;
pub mod sqlite;
