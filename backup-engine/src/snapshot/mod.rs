//! Snapshot subsystem contract.
//!
//! The engine never talks to the native snapshot service directly; it drives a
//! [`SnapshotSubsystem`] obtained from a [`SnapshotProvider`], one fresh handle
//! per snapshot-set cycle, through the [`coordinator::SnapshotCoordinator`].

pub mod catalog;
pub mod coordinator;

use crate::utils::errors::SnapshotError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub use coordinator::{CoordinatorState, SnapshotCoordinator, SnapshotView};

pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// Writer class of the Hyper-V VSS writer.
pub const HYPERV_WRITER_ID: Uuid = Uuid::from_u128(0x66841cd4_6ded_4f4b_8f17_fd23f8ddc3de);

/// How the subsystem is asked to treat this backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupState {
    pub select_components: bool,
    pub bootable_system_state: bool,
    /// Snapshots survive the requesting handle until explicitly deleted
    pub persistent: bool,
}

impl BackupState {
    /// Full, persistent, component-based backup without bootable system state.
    pub fn full() -> Self {
        Self {
            select_components: true,
            bootable_system_state: false,
            persistent: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentType {
    Database,
    #[default]
    FileGroup,
}

/// One declared file group of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Directory holding the files
    pub path: String,

    /// File name or pattern inside `path`
    pub file_specification: String,

    #[serde(default)]
    pub recursive: bool,
}

impl FileSpec {
    /// Path the file group refers to: the directory itself when recursive,
    /// otherwise the directory joined with the file specification.
    pub fn manifest_path(&self) -> String {
        if self.recursive {
            self.path.clone()
        } else {
            crate::volume::join(&self.path, &self.file_specification)
        }
    }
}

/// Component (virtual machine) as described by writer metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    /// Stable identifier; the VM id for the Hyper-V writer
    pub name: String,

    /// Human readable caption reported by the writer
    #[serde(default)]
    pub caption: String,

    #[serde(default)]
    pub component_type: ComponentType,

    #[serde(default)]
    pub logical_path: Option<String>,

    #[serde(default)]
    pub files: Vec<FileSpec>,
}

/// Metadata of one writer instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterMetadata {
    pub instance_id: Uuid,
    pub writer_id: Uuid,
    pub components: Vec<ComponentMetadata>,
}

/// Identity of the writer owning a component, needed to (un)register it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterRef {
    pub instance_id: Uuid,
    pub writer_id: Uuid,
}

impl From<&WriterMetadata> for WriterRef {
    fn from(writer: &WriterMetadata) -> Self {
        Self {
            instance_id: writer.instance_id,
            writer_id: writer.writer_id,
        }
    }
}

/// Handle on the native snapshot service for one snapshot-set cycle.
///
/// Calls arrive in the order enforced by the coordinator:
/// initialize, enable writers, gather metadata, add components, start set,
/// add volumes, prepare, snapshot, device paths, succeeded, complete, delete.
pub trait SnapshotSubsystem {
    fn initialize_for_backup(&mut self, state: &BackupState) -> SnapshotResult<()>;

    fn enable_writer_classes(&mut self, writer_ids: &[Uuid]) -> SnapshotResult<()>;

    fn gather_writer_metadata(&mut self) -> SnapshotResult<Vec<WriterMetadata>>;

    fn add_component(
        &mut self,
        writer: WriterRef,
        component: &ComponentMetadata,
    ) -> SnapshotResult<()>;

    fn start_snapshot_set(&mut self) -> SnapshotResult<Uuid>;

    /// Request a snapshot of `volume_name`; returns the snapshot id.
    fn add_to_snapshot_set(&mut self, volume_name: &str) -> SnapshotResult<Uuid>;

    fn prepare_for_backup(&mut self) -> SnapshotResult<()>;

    /// Materialize every requested snapshot. Blocks until they exist.
    fn do_snapshot_set(&mut self) -> SnapshotResult<()>;

    /// Device path the snapshot can be read through.
    fn snapshot_device_path(&mut self, snapshot_id: Uuid) -> SnapshotResult<PathBuf>;

    fn set_backup_succeeded(
        &mut self,
        writer: WriterRef,
        component: &ComponentMetadata,
        succeeded: bool,
    ) -> SnapshotResult<()>;

    fn backup_complete(&mut self) -> SnapshotResult<()>;

    fn delete_snapshot_set(&mut self, set_id: Uuid) -> SnapshotResult<()>;
}

/// Factory for subsystem handles; the native service allows one active
/// handle per backup cycle.
pub trait SnapshotProvider {
    type Subsystem: SnapshotSubsystem;

    fn create(&self) -> SnapshotResult<Self::Subsystem>;
}

/// Cluster shared volume support.
pub trait ClusterVolumes {
    /// Whether the host can have shared volumes at all.
    fn is_supported(&self) -> bool;

    fn is_path_on_shared_volume(&self, path: &str) -> bool;

    /// Prepare the shared volume holding `path`; returns (volume path, volume name).
    fn prepare_shared_volume_for_backup(&self, path: &str) -> SnapshotResult<(String, String)>;
}

/// Host without cluster shared volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClusterVolumes;

impl ClusterVolumes for NoClusterVolumes {
    fn is_supported(&self) -> bool {
        false
    }

    fn is_path_on_shared_volume(&self, _path: &str) -> bool {
        false
    }

    fn prepare_shared_volume_for_backup(&self, path: &str) -> SnapshotResult<(String, String)> {
        Err(SnapshotError::new(
            "ClusterPrepareSharedVolumeForBackup",
            format!("{} is not on a cluster shared volume", path),
        ))
    }
}
