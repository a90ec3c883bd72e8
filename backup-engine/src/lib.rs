//! Hyper-V Backup Engine
//!
//! Crash-consistent virtual machine backups: a snapshot set is created for the
//! volumes holding each VM's files, the files are read from the snapshot, and
//! written either into a compressed archive or as a plain directory copy.

pub mod config;
pub mod directory;
pub mod executor;
pub mod fs;
pub mod output;
pub mod progress;
pub mod selector;
pub mod snapshot;
pub mod utils;
pub mod volume;

// Re-export commonly used types
pub use config::{BackupOptions, OutputMode};
pub use directory::{KeyKind, NameDirectory, StaticDirectory};
pub use executor::{BackupManager, BackupOutcome};
pub use progress::{Flow, ProgressEvent, ProgressObserver};
pub use utils::errors::{BackupError, ErrorKind, SnapshotError};
pub type Result<T> = std::result::Result<T, BackupError>;
