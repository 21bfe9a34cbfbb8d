//! Shared ids, error model, containers and configuration used by every `reshard` crate.

pub mod config;
pub mod containers;
pub mod error;
pub mod ids;
