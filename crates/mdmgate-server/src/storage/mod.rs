//! `SQLite` storage for the mdmgate server.
//!
//! Provides persistence for devices, push certificates, the command log,
//! sync jobs and the data synchronized from external directories.

mod models;
mod queries_commands;
mod queries_devices;
mod queries_directory;
mod queries_push;
mod queries_sync;


pub use mdmgate_core::db::DatabaseError;
pub use models::*;
pub use queries_commands::{InFlightTransition, NewCommandParams, TransitionOutcome};
pub use queries_devices::EnrollDeviceParams;
pub use queries_directory::{CatalogPackageParams, DirectoryDeviceParams};
pub use queries_push::NewPushCertificateParams;

mdmgate_core::define_database!(MdmDatabase, "MDM database migrations complete");
