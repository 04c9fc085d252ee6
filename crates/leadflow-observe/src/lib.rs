//! Observability setup for Leadflow: structured `tracing` output with an
//! optional OpenTelemetry bridge.

pub mod tracing_setup;
