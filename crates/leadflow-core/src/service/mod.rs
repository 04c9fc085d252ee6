//! Service-level ports shared by the pipeline.

pub mod hash;
