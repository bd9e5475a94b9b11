//! Snapshot Agent Library
//!
//! Integrity-verified snapshot backups of a set of data directories, with
//! optional compression and encryption, count/size retention for automatic
//! backups and a periodic backup loop.

pub mod codec;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod fs;
pub mod retention;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{BackupEngine, RestoreOptions, RestoreResult};
pub use utils::errors::{BackupError, ErrorKind};
pub type Result<T> = std::result::Result<T, BackupError>;
