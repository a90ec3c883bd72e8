//! Error types for the backup engine.

use crate::snapshot::coordinator::CoordinatorState;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the snapshot subsystem for one of its operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Snapshot subsystem {operation} failed: {message}")]
pub struct SnapshotError {
    pub operation: &'static str,
    pub message: String,
}

impl SnapshotError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("No known volume matches path: {path}")]
    NoMatchingVolume { path: String },

    #[error("Entry \"{}\" not found in snapshot", path.display())]
    MissingEntry { path: PathBuf },

    #[error("Path \"{path}\" leaves its volume or output folder")]
    UnsafePath { path: String },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Writer {0} not present in writer metadata")]
    WriterNotFound(Uuid),

    #[error("Invalid snapshot coordinator transition: {operation} called in state {from:?}")]
    InvalidTransition {
        from: CoordinatorState,
        operation: &'static str,
    },

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error for {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid archive password")]
    InvalidPassword,

    #[error("Name directory error: {0}")]
    Directory(String),
}

/// Coarse classification of a [`BackupError`], used by callers to pick an exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ManifestInconsistency,
    SnapshotSubsystem,
    Cancelled,
    OutputWrite,
    Configuration,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::NoMatchingVolume { .. }
            | BackupError::MissingEntry { .. }
            | BackupError::UnsafePath { .. } => ErrorKind::ManifestInconsistency,
            BackupError::Snapshot(_)
            | BackupError::WriterNotFound(_)
            | BackupError::InvalidTransition { .. } => ErrorKind::SnapshotSubsystem,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::Output { .. } | BackupError::Archive { .. } | BackupError::Io(_) => {
                ErrorKind::OutputWrite
            }
            BackupError::Config(_) | BackupError::Directory(_) | BackupError::InvalidPassword => {
                ErrorKind::Configuration
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }

    pub(crate) fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Output {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
