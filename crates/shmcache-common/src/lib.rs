//! shmcache Common - Shared types and utilities
//!
//! This crate provides the blob naming scheme, error definitions, and
//! client configuration used across all shmcache components.

pub mod config;
pub mod error;
pub mod types;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use types::*;
