//! Shared domain types for Leadflow.
//!
//! This crate contains the domain types used across the pipeline engine:
//! leads, campaigns, runs, steps, outputs, agent configuration, and their
//! associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod id;
pub mod lead;
pub mod run;
