//! Utility modules for the backup engine.

pub mod errors;

pub use errors::{BackupError, ErrorKind, Result, SnapshotError};
