//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod campaign;
mod codec;
pub mod pool;
pub mod run;
