//! Pipeline engine and repository trait definitions for Leadflow.
//!
//! This crate defines the "ports" (repository traits, agent dispatch and
//! email delivery) that the infrastructure layer implements. It depends only
//! on `leadflow-types` -- never on `leadflow-infra` or any database/IO crate.

pub mod pipeline;
pub mod repository;
pub mod service;

#[cfg(test)]
mod testing;
