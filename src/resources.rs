//! Builders for the objects the operator creates on behalf of an upgrade.

pub mod common;
pub mod plan;
pub mod repo;
