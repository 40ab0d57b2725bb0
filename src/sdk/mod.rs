//! The persistence facade handed to every feature of the workspace.
//!
//! This module provides the [`Store`], which routes each call to the primary
//! or fallback backend, its configuration, and the auto-backup task.
pub mod backup;
pub mod config;
pub mod store;

pub use backup::spawn_auto_backup;
pub use config::StoreConfig;
pub use store::{BackendState, Store, BACKUP_KEY};
