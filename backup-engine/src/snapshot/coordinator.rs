//! Snapshot-set lifecycle for one backup cycle.
//!
//! The coordinator owns the subsystem handle and walks it through a fixed
//! sequence of states. Any call made out of order fails with
//! [`BackupError::InvalidTransition`]. Once a snapshot set exists it is deleted
//! exactly once: by [`SnapshotCoordinator::teardown`], or on drop if the owner
//! never got that far.

use super::{
    BackupState, ClusterVolumes, ComponentMetadata, SnapshotSubsystem, WriterRef,
    HYPERV_WRITER_ID,
};
use crate::progress::{EventContext, Flow, ProgressBus, ProgressEvent};
use crate::volume::{path_root, Volume, VolumeMap};
use crate::{BackupError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Initialized,
    MetadataGathered,
    ComponentsRegistered,
    SetStarted,
    SnapshotsAdded,
    Prepared,
    Committed,
    FilesRead,
    BackupMarkedComplete,
    TornDown,
}

/// Read access to a committed snapshot set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotView {
    volumes: VolumeMap,
    /// Volume name -> snapshot device path
    devices: Vec<(String, PathBuf)>,
}

impl SnapshotView {
    pub fn new(volumes: VolumeMap, devices: Vec<(String, PathBuf)>) -> Self {
        Self { volumes, devices }
    }

    pub fn volumes(&self) -> &VolumeMap {
        &self.volumes
    }

    pub fn device_path(&self, volume_name: &str) -> Option<&Path> {
        self.devices
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(volume_name))
            .map(|(_, path)| path.as_path())
    }

    /// Owning volume of a manifest path and the device path of its snapshot.
    pub fn locate(&self, manifest_path: &str) -> Result<(&Volume, &Path)> {
        let volume = self.volumes.resolve(manifest_path)?;
        let device = self
            .device_path(&volume.name)
            .ok_or_else(|| BackupError::NoMatchingVolume {
                path: manifest_path.to_string(),
            })?;
        Ok((volume, device))
    }
}

pub struct SnapshotCoordinator<'b, 'o, S: SnapshotSubsystem> {
    subsystem: S,
    cluster: &'b dyn ClusterVolumes,
    bus: &'b mut ProgressBus<'o>,
    state: CoordinatorState,
    writer: Option<WriterRef>,
    available: Vec<ComponentMetadata>,
    components: Vec<ComponentMetadata>,
    volumes: VolumeMap,
    context: EventContext,
    set_id: Option<Uuid>,
    /// Volume name -> snapshot id
    snapshots: Vec<(String, Uuid)>,
    view: Option<SnapshotView>,
    succeeded_marked: bool,
}

impl<'b, 'o, S: SnapshotSubsystem> SnapshotCoordinator<'b, 'o, S> {
    pub fn new(subsystem: S, cluster: &'b dyn ClusterVolumes, bus: &'b mut ProgressBus<'o>) -> Self {
        Self {
            subsystem,
            cluster,
            bus,
            state: CoordinatorState::Idle,
            writer: None,
            available: Vec::new(),
            components: Vec::new(),
            volumes: VolumeMap::new(),
            context: EventContext::default(),
            set_id: None,
            snapshots: Vec::new(),
            view: None,
            succeeded_marked: false,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn components(&self) -> &[ComponentMetadata] {
        &self.components
    }

    pub fn volumes(&self) -> &VolumeMap {
        &self.volumes
    }

    fn require_state(&self, expected: CoordinatorState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BackupError::InvalidTransition {
                from: self.state,
                operation,
            })
        }
    }

    /// Prepare the subsystem for a full backup limited to the Hyper-V writer.
    pub fn initialize(&mut self) -> Result<()> {
        self.require_state(CoordinatorState::Idle, "initialize")?;
        self.bus.emit(&ProgressEvent::SnapshotInitializing)?;

        self.subsystem.initialize_for_backup(&BackupState::full())?;
        self.subsystem.enable_writer_classes(&[HYPERV_WRITER_ID])?;

        self.state = CoordinatorState::Initialized;
        debug!("Snapshot subsystem initialized");
        Ok(())
    }

    /// Collect writer metadata and keep the Hyper-V writer's components.
    pub fn gather_metadata(&mut self) -> Result<()> {
        self.require_state(CoordinatorState::Initialized, "gather_metadata")?;

        let writers = self.subsystem.gather_writer_metadata()?;
        let writer = writers
            .into_iter()
            .find(|w| w.writer_id == HYPERV_WRITER_ID)
            .ok_or(BackupError::WriterNotFound(HYPERV_WRITER_ID))?;

        debug!(
            "Writer {} reports {} components",
            writer.instance_id,
            writer.components.len()
        );

        self.writer = Some(WriterRef::from(&writer));
        self.available = writer.components;
        self.state = CoordinatorState::MetadataGathered;
        Ok(())
    }

    /// Register every writer component whose name is a key of `requested`
    /// (id -> display name) and record the volumes its files live on.
    pub fn register_components(
        &mut self,
        requested: &BTreeMap<String, String>,
    ) -> Result<&[ComponentMetadata]> {
        self.require_state(CoordinatorState::MetadataGathered, "register_components")?;
        let writer = self.writer.ok_or(BackupError::WriterNotFound(HYPERV_WRITER_ID))?;

        for component in std::mem::take(&mut self.available) {
            let Some(display_name) = requested
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(&component.name))
                .map(|(_, name)| name.clone())
            else {
                continue;
            };

            self.subsystem.add_component(writer, &component)?;

            for file in &component.files {
                let volume = self.discover_volume(&file.path)?;
                if self.volumes.insert(volume.clone()) {
                    debug!("Volume {} ({}) added for {}", volume.path, volume.name, component.name);
                }
            }

            info!("Registered component {} ({})", component.name, display_name);
            self.context
                .components
                .insert(component.name.clone(), display_name);
            self.components.push(component);
        }

        self.context.volumes = self.volumes.iter().cloned().collect();
        self.state = CoordinatorState::ComponentsRegistered;
        Ok(self.components.as_slice())
    }

    fn discover_volume(&self, path: &str) -> Result<Volume> {
        if self.cluster.is_supported() && self.cluster.is_path_on_shared_volume(path) {
            let (volume_path, volume_name) = self.cluster.prepare_shared_volume_for_backup(path)?;
            return Ok(Volume::new(volume_path, volume_name));
        }

        let root = path_root(path);
        if root.is_empty() {
            return Err(BackupError::NoMatchingVolume {
                path: path.to_string(),
            });
        }
        Ok(Volume::new(root.clone(), root))
    }

    /// Start a snapshot set over every recorded volume and create it.
    pub fn create_set(&mut self) -> Result<()> {
        self.require_state(CoordinatorState::ComponentsRegistered, "create_set")?;
        if self.components.is_empty() {
            return Err(BackupError::InvalidTransition {
                from: self.state,
                operation: "create_set",
            });
        }

        let set_id = self.subsystem.start_snapshot_set()?;
        self.set_id = Some(set_id);
        self.state = CoordinatorState::SetStarted;

        for name in self.volumes.names() {
            let snapshot_id = self.subsystem.add_to_snapshot_set(name)?;
            debug!("Snapshot {} requested for volume {}", snapshot_id, name);
            self.snapshots.push((name.to_string(), snapshot_id));
        }
        self.state = CoordinatorState::SnapshotsAdded;

        self.subsystem.prepare_for_backup()?;
        self.state = CoordinatorState::Prepared;

        self.bus.emit(&ProgressEvent::SnapshotSetStarting(&self.context))?;
        info!(
            "Creating snapshot set {} ({} components, {} volumes)",
            set_id,
            self.components.len(),
            self.snapshots.len()
        );
        self.subsystem.do_snapshot_set()?;
        self.state = CoordinatorState::Committed;
        self.bus.emit(&ProgressEvent::SnapshotSetReady(&self.context))?;

        Ok(())
    }

    /// Look up the device path of every snapshot in the set.
    pub fn resolve_snapshot_paths(&mut self) -> Result<&SnapshotView> {
        self.require_state(CoordinatorState::Committed, "resolve_snapshot_paths")?;
        if self.view.is_some() {
            return Err(BackupError::InvalidTransition {
                from: self.state,
                operation: "resolve_snapshot_paths",
            });
        }

        let mut devices = Vec::with_capacity(self.snapshots.len());
        for (name, snapshot_id) in &self.snapshots {
            let device = self.subsystem.snapshot_device_path(*snapshot_id)?;
            debug!("Volume {} readable at {}", name, device.display());
            devices.push((name.clone(), device));
        }

        let view = self
            .view
            .insert(SnapshotView::new(self.volumes.clone(), devices));
        Ok(&*view)
    }

    /// Hand the committed snapshot to `read`; the state moves on only if it succeeds.
    pub fn read_files<T, F>(&mut self, read: F) -> Result<T>
    where
        F: FnOnce(&[ComponentMetadata], &SnapshotView, &mut ProgressBus<'o>) -> Result<T>,
    {
        self.require_state(CoordinatorState::Committed, "read_files")?;
        let view = self.view.as_ref().ok_or(BackupError::InvalidTransition {
            from: self.state,
            operation: "read_files",
        })?;

        let value = read(&self.components, view, &mut *self.bus)?;
        self.state = CoordinatorState::FilesRead;
        Ok(value)
    }

    /// Tell the subsystem every registered component was captured.
    pub fn mark_succeeded(&mut self) -> Result<()> {
        self.require_state(CoordinatorState::FilesRead, "mark_succeeded")?;
        let writer = self.writer.ok_or(BackupError::WriterNotFound(HYPERV_WRITER_ID))?;

        for component in &self.components {
            self.subsystem.set_backup_succeeded(writer, component, true)?;
        }
        self.succeeded_marked = true;
        Ok(())
    }

    /// Finalize the backup transaction.
    pub fn complete(&mut self) -> Result<()> {
        self.require_state(CoordinatorState::FilesRead, "complete")?;
        if !self.succeeded_marked {
            return Err(BackupError::InvalidTransition {
                from: self.state,
                operation: "complete",
            });
        }

        self.subsystem.backup_complete()?;
        self.state = CoordinatorState::BackupMarkedComplete;
        Ok(())
    }

    /// Delete the snapshot set, if one was started. Safe to call from any state;
    /// the set is deleted at most once.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == CoordinatorState::TornDown {
            return Ok(());
        }
        self.state = CoordinatorState::TornDown;

        let Some(set_id) = self.set_id.take() else {
            return Ok(());
        };

        let flow = self
            .bus
            .notify(&ProgressEvent::SnapshotSetDeleting(&self.context));
        info!("Deleting snapshot set {}", set_id);
        self.subsystem.delete_snapshot_set(set_id)?;

        match flow {
            Flow::Continue => Ok(()),
            Flow::Cancel => Err(BackupError::Cancelled),
        }
    }
}

impl<S: SnapshotSubsystem> Drop for SnapshotCoordinator<'_, '_, S> {
    fn drop(&mut self) {
        if self.state != CoordinatorState::TornDown {
            if let Err(e) = self.teardown() {
                if !e.is_cancelled() {
                    error!("Snapshot set cleanup failed: {}", e);
                }
            }
        }
    }
}
