//! Tandem coordinator.
//!
//! Owns the repository and branch registry, assigns the per-branch tick to
//! every submitted event, persists the event history in SQLite and fans
//! events out to the other members of the branch.

pub mod config;
pub mod connection;
pub mod db;
pub mod logging;
pub mod registry;
pub mod server;

pub use config::{load_config, CoordinatorConfig};
pub use registry::{BranchKey, Registry, RegistryError};
pub use server::Server;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
