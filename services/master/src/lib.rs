//! forge master library.
//!
//! This crate primarily ships a `master` binary, but we expose a library
//! surface to enable integration testing and reuse.

pub mod actions;
pub mod caches;
pub mod config;
pub mod connection;
pub mod latent;
pub mod protocol;
pub mod registration;
pub mod worker_manager;

pub use connection::{Connection, WorkerInfo};
pub use worker_manager::{WorkerManager, WorkerManagerError};
