//! Hashing for frozen run snapshots.

pub mod hash;
