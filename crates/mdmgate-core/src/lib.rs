//! mdmgate core library
//!
//! Shared functionality for mdmgate components:
//! - TOML configuration with environment overrides
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Tracing initialization
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::ServerConfig;
pub use error::{Error, Result};
