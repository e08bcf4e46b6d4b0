//! Shared config, errors, wire protocol, and record model for nodegate.

pub mod config;
pub mod error;
pub mod file_store;
pub mod protocol;
pub mod records;
pub mod store;
