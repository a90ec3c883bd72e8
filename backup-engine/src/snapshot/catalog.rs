//! Snapshot provider backed by a JSON catalog.
//!
//! The catalog describes the virtual machines of a host and, for each volume,
//! a folder where a snapshot of that volume has already been materialized
//! (a mounted shadow copy, an LVM or ZFS snapshot, a test fixture...). It
//! serves as name directory, snapshot provider and cluster resolver at once.

use super::{
    BackupState, ClusterVolumes, ComponentMetadata, ComponentType, FileSpec, SnapshotProvider,
    SnapshotResult, SnapshotSubsystem, WriterMetadata, WriterRef, HYPERV_WRITER_ID,
};
use crate::directory::{is_excluded, matches_request, KeyKind, NameDirectory};
use crate::utils::errors::SnapshotError;
use crate::volume::{self, Volume};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVm {
    /// VM id, also the writer component name
    pub id: String,

    /// Display name
    pub name: String,

    #[serde(default)]
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVolume {
    pub path: String,

    /// Snapshot name of the volume; defaults to `path`
    #[serde(default)]
    pub name: Option<String>,

    /// Cluster shared volume
    #[serde(default)]
    pub shared: bool,

    /// Folder exposing the volume's snapshot
    pub snapshot_root: PathBuf,
}

impl CatalogVolume {
    pub fn volume_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }

    fn as_volume(&self) -> Volume {
        Volume::new(self.path.clone(), self.volume_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub virtual_machines: Vec<CatalogVm>,

    #[serde(default)]
    pub volumes: Vec<CatalogVolume>,
}

impl Catalog {
    /// Load a catalog from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    fn components(&self) -> Vec<ComponentMetadata> {
        self.virtual_machines
            .iter()
            .map(|vm| ComponentMetadata {
                name: vm.id.clone(),
                caption: vm.name.clone(),
                component_type: ComponentType::FileGroup,
                logical_path: None,
                files: vm.files.clone(),
            })
            .collect()
    }

    fn owning_volume(&self, path: &str) -> Option<&CatalogVolume> {
        self.volumes
            .iter()
            .filter(|v| volume::strip_prefix_ignore_case(path, &v.path).is_some())
            .max_by_key(|v| v.path.len())
    }
}

impl NameDirectory for Catalog {
    fn resolve(
        &self,
        requested: &[String],
        exclude: &[String],
        kind: KeyKind,
    ) -> Result<BTreeMap<String, String>> {
        Ok(self
            .virtual_machines
            .iter()
            .filter(|vm| matches_request(&vm.id, &vm.name, requested, kind))
            .filter(|vm| !is_excluded(&vm.name, exclude))
            .map(|vm| (vm.id.clone(), vm.name.clone()))
            .collect())
    }
}

impl ClusterVolumes for Catalog {
    fn is_supported(&self) -> bool {
        self.volumes.iter().any(|v| v.shared)
    }

    fn is_path_on_shared_volume(&self, path: &str) -> bool {
        self.owning_volume(path).is_some_and(|v| v.shared)
    }

    fn prepare_shared_volume_for_backup(&self, path: &str) -> SnapshotResult<(String, String)> {
        match self.owning_volume(path) {
            Some(v) if v.shared => Ok((v.path.clone(), v.volume_name().to_string())),
            _ => Err(SnapshotError::new(
                "ClusterPrepareSharedVolumeForBackup",
                format!("{} is not on a shared volume", path),
            )),
        }
    }
}

impl SnapshotProvider for Catalog {
    type Subsystem = CatalogSubsystem;

    fn create(&self) -> SnapshotResult<CatalogSubsystem> {
        Ok(CatalogSubsystem {
            instance_id: Uuid::new_v4(),
            components: self.components(),
            volumes: self.volumes.iter().map(|v| (v.as_volume(), v.snapshot_root.clone())).collect(),
            set_id: None,
            snapshots: Vec::new(),
        })
    }
}

/// One snapshot cycle over a [`Catalog`].
#[derive(Debug)]
pub struct CatalogSubsystem {
    instance_id: Uuid,
    components: Vec<ComponentMetadata>,
    volumes: Vec<(Volume, PathBuf)>,
    set_id: Option<Uuid>,
    /// Snapshot id -> snapshot root
    snapshots: Vec<(Uuid, PathBuf)>,
}

impl CatalogSubsystem {
    fn require_set(&self, operation: &'static str) -> SnapshotResult<Uuid> {
        self.set_id
            .ok_or_else(|| SnapshotError::new(operation, "no snapshot set in progress"))
    }
}

impl SnapshotSubsystem for CatalogSubsystem {
    fn initialize_for_backup(&mut self, state: &BackupState) -> SnapshotResult<()> {
        debug!(
            "Catalog subsystem initialized (persistent: {})",
            state.persistent
        );
        Ok(())
    }

    fn enable_writer_classes(&mut self, _writer_ids: &[Uuid]) -> SnapshotResult<()> {
        Ok(())
    }

    fn gather_writer_metadata(&mut self) -> SnapshotResult<Vec<WriterMetadata>> {
        Ok(vec![WriterMetadata {
            instance_id: self.instance_id,
            writer_id: HYPERV_WRITER_ID,
            components: self.components.clone(),
        }])
    }

    fn add_component(
        &mut self,
        _writer: WriterRef,
        component: &ComponentMetadata,
    ) -> SnapshotResult<()> {
        debug!("Catalog component {} added", component.name);
        Ok(())
    }

    fn start_snapshot_set(&mut self) -> SnapshotResult<Uuid> {
        if let Some(set_id) = self.set_id {
            return Err(SnapshotError::new(
                "StartSnapshotSet",
                format!("snapshot set {} already in progress", set_id),
            ));
        }
        let set_id = Uuid::new_v4();
        self.set_id = Some(set_id);
        Ok(set_id)
    }

    fn add_to_snapshot_set(&mut self, volume_name: &str) -> SnapshotResult<Uuid> {
        self.require_set("AddToSnapshotSet")?;
        let root = self
            .volumes
            .iter()
            .find(|(v, _)| v.name.eq_ignore_ascii_case(volume_name))
            .map(|(_, root)| root.clone())
            .ok_or_else(|| {
                SnapshotError::new(
                    "AddToSnapshotSet",
                    format!("volume {} is not in the catalog", volume_name),
                )
            })?;

        let snapshot_id = Uuid::new_v4();
        self.snapshots.push((snapshot_id, root));
        Ok(snapshot_id)
    }

    fn prepare_for_backup(&mut self) -> SnapshotResult<()> {
        self.require_set("PrepareForBackup").map(|_| ())
    }

    fn do_snapshot_set(&mut self) -> SnapshotResult<()> {
        self.require_set("DoSnapshotSet")?;
        for (_, root) in &self.snapshots {
            if !root.is_dir() {
                return Err(SnapshotError::new(
                    "DoSnapshotSet",
                    format!("snapshot root {} is not a directory", root.display()),
                ));
            }
        }
        Ok(())
    }

    fn snapshot_device_path(&mut self, snapshot_id: Uuid) -> SnapshotResult<PathBuf> {
        self.snapshots
            .iter()
            .find(|(id, _)| *id == snapshot_id)
            .map(|(_, root)| root.clone())
            .ok_or_else(|| {
                SnapshotError::new("GetSnapshotProperties", format!("unknown snapshot {}", snapshot_id))
            })
    }

    fn set_backup_succeeded(
        &mut self,
        _writer: WriterRef,
        _component: &ComponentMetadata,
        _succeeded: bool,
    ) -> SnapshotResult<()> {
        Ok(())
    }

    fn backup_complete(&mut self) -> SnapshotResult<()> {
        self.require_set("BackupComplete").map(|_| ())
    }

    fn delete_snapshot_set(&mut self, set_id: Uuid) -> SnapshotResult<()> {
        if self.set_id != Some(set_id) {
            return Err(SnapshotError::new(
                "DeleteSnapshots",
                format!("unknown snapshot set {}", set_id),
            ));
        }
        // Snapshot roots are owned by whoever produced them; only forget them.
        self.set_id = None;
        self.snapshots.clear();
        Ok(())
    }
}
