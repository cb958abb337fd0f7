//! mdmgate server library
//!
//! Core functionality for the MDM server:
//! - `SQLite` storage for devices, command logs, push certificates and sync jobs
//! - Device authentication (mTLS headers or signed messages) and operator JWTs
//! - Durable per-device command queue with delivery deadlines
//! - APNs push dispatch with retry
//! - Fire-and-forget directory and catalog sync jobs
//! - axum routes for the device protocol and the operator API

pub mod auth;
pub mod credentials;
pub mod http;
pub mod protocol;
pub mod push;
pub mod queue;
pub mod storage;
pub mod sync;
