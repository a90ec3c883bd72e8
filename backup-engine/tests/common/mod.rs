//! Recording fake of the snapshot subsystem plus on-disk fixtures.

#![allow(dead_code)]

use hyperv_backup_engine::snapshot::{
    BackupState, ComponentMetadata, ComponentType, FileSpec, SnapshotProvider, SnapshotResult,
    SnapshotSubsystem, WriterMetadata, WriterRef, HYPERV_WRITER_ID,
};
use hyperv_backup_engine::{BackupOptions, OutputMode, SnapshotError, StaticDirectory};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize,
    EnableWriters(Vec<Uuid>),
    GatherMetadata,
    AddComponent(String),
    StartSet,
    AddVolume(String),
    Prepare,
    DoSnapshot,
    DevicePath,
    Succeeded(String),
    Complete,
    DeleteSet,
}

pub type Journal = Arc<Mutex<Vec<Call>>>;

pub fn calls(journal: &Journal) -> Vec<Call> {
    journal.lock().unwrap().clone()
}

pub fn count(journal: &Journal, call: &Call) -> usize {
    journal.lock().unwrap().iter().filter(|c| *c == call).count()
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    pub components: Vec<ComponentMetadata>,
    /// Volume name -> folder holding its snapshot
    pub roots: Vec<(String, PathBuf)>,
    pub journal: Journal,
    pub fail_snapshot: bool,
    pub hide_writer: bool,
}

impl SnapshotProvider for FakeProvider {
    type Subsystem = FakeSubsystem;

    fn create(&self) -> SnapshotResult<FakeSubsystem> {
        Ok(FakeSubsystem {
            provider: self.clone(),
            snapshots: Vec::new(),
            set_id: None,
        })
    }
}

pub struct FakeSubsystem {
    provider: FakeProvider,
    snapshots: Vec<(Uuid, PathBuf)>,
    set_id: Option<Uuid>,
}

impl FakeSubsystem {
    fn record(&self, call: Call) {
        self.provider.journal.lock().unwrap().push(call);
    }
}

impl SnapshotSubsystem for FakeSubsystem {
    fn initialize_for_backup(&mut self, state: &BackupState) -> SnapshotResult<()> {
        assert_eq!(*state, BackupState::full());
        self.record(Call::Initialize);
        Ok(())
    }

    fn enable_writer_classes(&mut self, writer_ids: &[Uuid]) -> SnapshotResult<()> {
        self.record(Call::EnableWriters(writer_ids.to_vec()));
        Ok(())
    }

    fn gather_writer_metadata(&mut self) -> SnapshotResult<Vec<WriterMetadata>> {
        self.record(Call::GatherMetadata);
        let writer_id = if self.provider.hide_writer {
            Uuid::new_v4()
        } else {
            HYPERV_WRITER_ID
        };
        Ok(vec![WriterMetadata {
            instance_id: Uuid::new_v4(),
            writer_id,
            components: self.provider.components.clone(),
        }])
    }

    fn add_component(
        &mut self,
        _writer: WriterRef,
        component: &ComponentMetadata,
    ) -> SnapshotResult<()> {
        self.record(Call::AddComponent(component.name.clone()));
        Ok(())
    }

    fn start_snapshot_set(&mut self) -> SnapshotResult<Uuid> {
        self.record(Call::StartSet);
        let set_id = Uuid::new_v4();
        self.set_id = Some(set_id);
        Ok(set_id)
    }

    fn add_to_snapshot_set(&mut self, volume_name: &str) -> SnapshotResult<Uuid> {
        self.record(Call::AddVolume(volume_name.to_string()));
        let root = self
            .provider
            .roots
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(volume_name))
            .map(|(_, root)| root.clone())
            .ok_or_else(|| SnapshotError::new("AddToSnapshotSet", volume_name.to_string()))?;
        let id = Uuid::new_v4();
        self.snapshots.push((id, root));
        Ok(id)
    }

    fn prepare_for_backup(&mut self) -> SnapshotResult<()> {
        self.record(Call::Prepare);
        Ok(())
    }

    fn do_snapshot_set(&mut self) -> SnapshotResult<()> {
        self.record(Call::DoSnapshot);
        if self.provider.fail_snapshot {
            return Err(SnapshotError::new("DoSnapshotSet", "writer timed out"));
        }
        Ok(())
    }

    fn snapshot_device_path(&mut self, snapshot_id: Uuid) -> SnapshotResult<PathBuf> {
        self.record(Call::DevicePath);
        self.snapshots
            .iter()
            .find(|(id, _)| *id == snapshot_id)
            .map(|(_, root)| root.clone())
            .ok_or_else(|| SnapshotError::new("GetSnapshotProperties", snapshot_id.to_string()))
    }

    fn set_backup_succeeded(
        &mut self,
        _writer: WriterRef,
        component: &ComponentMetadata,
        succeeded: bool,
    ) -> SnapshotResult<()> {
        assert!(succeeded);
        self.record(Call::Succeeded(component.name.clone()));
        Ok(())
    }

    fn backup_complete(&mut self) -> SnapshotResult<()> {
        self.record(Call::Complete);
        Ok(())
    }

    fn delete_snapshot_set(&mut self, set_id: Uuid) -> SnapshotResult<()> {
        assert_eq!(self.set_id, Some(set_id));
        self.record(Call::DeleteSet);
        Ok(())
    }
}

/// A host with one volume `C:\` whose snapshot lives in a temp folder.
pub struct Fixture {
    pub snapshot: TempDir,
    pub output: TempDir,
    pub provider: FakeProvider,
    pub directory: StaticDirectory,
}

impl Fixture {
    pub fn new() -> Self {
        let snapshot = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let provider = FakeProvider {
            roots: vec![("C:\\".to_string(), snapshot.path().to_path_buf())],
            ..Default::default()
        };
        Self {
            snapshot,
            output,
            provider,
            directory: StaticDirectory::new(),
        }
    }

    /// Write `data` at the volume-relative `path` (`/` separated) of the snapshot.
    pub fn write_file(&self, path: &str, data: &[u8]) {
        let target = self.snapshot.path().join(path);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(target, data).unwrap();
    }

    pub fn add_vm(&mut self, id: &str, name: &str, files: Vec<FileSpec>) {
        self.provider.components.push(ComponentMetadata {
            name: id.to_string(),
            caption: format!("caption of {}", name),
            component_type: ComponentType::FileGroup,
            logical_path: None,
            files,
        });
        self.directory.insert(id, name);
    }

    /// A VM with one disk and a configuration folder.
    pub fn add_standard_vm(&mut self, id: &str, name: &str) {
        self.write_file(
            &format!("Hyper-V/{}/Virtual Hard Disks/disk.vhdx", name),
            format!("disk of {}", name).as_bytes(),
        );
        self.write_file(
            &format!("Hyper-V/{}/Virtual Machines/{}.vmcx", name, id),
            b"<configuration/>",
        );
        self.add_vm(
            id,
            name,
            vec![
                file_spec(&format!("C:\\Hyper-V\\{}\\Virtual Hard Disks", name), "disk.vhdx"),
                folder_spec(&format!("C:\\Hyper-V\\{}\\Virtual Machines", name)),
            ],
        );
    }

    pub fn options(&self, output: OutputMode) -> BackupOptions {
        BackupOptions {
            output_dir: self.output.path().to_path_buf(),
            name_template: "{name}{ext}".to_string(),
            output,
            ..Default::default()
        }
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output.path().join(name)
    }

    pub fn output_is_empty(&self) -> bool {
        fs::read_dir(self.output.path()).unwrap().next().is_none()
    }
}

pub fn file_spec(dir: &str, name: &str) -> FileSpec {
    FileSpec {
        path: dir.to_string(),
        file_specification: name.to_string(),
        recursive: false,
    }
}

pub fn folder_spec(dir: &str) -> FileSpec {
    FileSpec {
        path: dir.to_string(),
        file_specification: "*".to_string(),
        recursive: true,
    }
}

pub fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

pub fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
