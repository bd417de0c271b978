//! Upgrade phase implementations.
//!
//! Each phase reads the current status and returns the status it wants
//! persisted. The driver decides which phase runs and performs the write.

pub mod addons;
pub mod init;
pub mod manifest;
pub mod nodes;
pub mod repo;
