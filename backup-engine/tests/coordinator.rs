mod common;

use common::*;
use hyperv_backup_engine::progress::{Flow, ProgressBus, ProgressEvent};
use hyperv_backup_engine::snapshot::{
    ClusterVolumes, CoordinatorState, NoClusterVolumes, SnapshotCoordinator, SnapshotProvider,
    SnapshotResult, HYPERV_WRITER_ID,
};
use hyperv_backup_engine::BackupError;
use std::collections::BTreeMap;

const VM: &str = "6C1E2B3A-0000-0000-0000-00000000000A";

fn requested() -> BTreeMap<String, String> {
    BTreeMap::from([(VM.to_string(), "app01".to_string())])
}

fn fixture() -> Fixture {
    let mut fixture = Fixture::new();
    fixture.add_standard_vm(VM, "app01");
    fixture
}

#[test]
fn test_full_lifecycle_order() {
    let fixture = fixture();
    let mut bus = ProgressBus::silent();
    let subsystem = fixture.provider.create().unwrap();
    let mut coordinator = SnapshotCoordinator::new(subsystem, &NoClusterVolumes, &mut bus);

    coordinator.initialize().unwrap();
    coordinator.gather_metadata().unwrap();
    assert_eq!(coordinator.register_components(&requested()).unwrap().len(), 1);
    coordinator.create_set().unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Committed);

    let view = coordinator.resolve_snapshot_paths().unwrap();
    assert_eq!(view.device_path("c:\\"), Some(fixture.snapshot.path()));

    let files = coordinator
        .read_files(|components, _view, _bus| Ok(components[0].files.len()))
        .unwrap();
    assert_eq!(files, 2);

    coordinator.mark_succeeded().unwrap();
    coordinator.complete().unwrap();
    coordinator.teardown().unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::TornDown);
    // second teardown is a no-op
    coordinator.teardown().unwrap();
    drop(coordinator);

    assert_eq!(
        calls(&fixture.provider.journal),
        vec![
            Call::Initialize,
            Call::EnableWriters(vec![HYPERV_WRITER_ID]),
            Call::GatherMetadata,
            Call::AddComponent(VM.to_string()),
            Call::StartSet,
            Call::AddVolume("C:\\".to_string()),
            Call::Prepare,
            Call::DoSnapshot,
            Call::DevicePath,
            Call::Succeeded(VM.to_string()),
            Call::Complete,
            Call::DeleteSet,
        ]
    );
}

#[test]
fn test_out_of_order_call_rejected() {
    let fixture = fixture();
    let mut bus = ProgressBus::silent();
    let subsystem = fixture.provider.create().unwrap();
    let mut coordinator = SnapshotCoordinator::new(subsystem, &NoClusterVolumes, &mut bus);

    let err = coordinator.create_set().unwrap_err();
    assert!(matches!(
        err,
        BackupError::InvalidTransition {
            from: CoordinatorState::Idle,
            operation: "create_set"
        }
    ));

    coordinator.initialize().unwrap();
    coordinator.gather_metadata().unwrap();
    coordinator.register_components(&requested()).unwrap();
    coordinator.create_set().unwrap();
    coordinator.resolve_snapshot_paths().unwrap();

    // completing before the files are read is refused
    assert!(matches!(
        coordinator.complete(),
        Err(BackupError::InvalidTransition { .. })
    ));
    assert!(matches!(
        coordinator.initialize(),
        Err(BackupError::InvalidTransition { .. })
    ));
}

#[test]
fn test_no_matching_component() {
    let fixture = fixture();
    let mut bus = ProgressBus::silent();
    let subsystem = fixture.provider.create().unwrap();
    let mut coordinator = SnapshotCoordinator::new(subsystem, &NoClusterVolumes, &mut bus);

    coordinator.initialize().unwrap();
    coordinator.gather_metadata().unwrap();
    let other = BTreeMap::from([("unknown".to_string(), "ghost".to_string())]);
    assert!(coordinator.register_components(&other).unwrap().is_empty());
    assert!(coordinator.create_set().is_err());
    coordinator.teardown().unwrap();
    drop(coordinator);

    assert_eq!(count(&fixture.provider.journal, &Call::StartSet), 0);
    assert_eq!(count(&fixture.provider.journal, &Call::DeleteSet), 0);
}

#[test]
fn test_drop_deletes_set() {
    let fixture = fixture();
    let mut deleting = 0;
    let mut observer = |event: &ProgressEvent<'_>| {
        if matches!(event, ProgressEvent::SnapshotSetDeleting(_)) {
            deleting += 1;
        }
        Flow::Continue
    };
    let mut bus = ProgressBus::new(Some(&mut observer));

    {
        let subsystem = fixture.provider.create().unwrap();
        let mut coordinator = SnapshotCoordinator::new(subsystem, &NoClusterVolumes, &mut bus);
        coordinator.initialize().unwrap();
        coordinator.gather_metadata().unwrap();
        coordinator.register_components(&requested()).unwrap();
        coordinator.create_set().unwrap();
        // owner bails out without tearing down
    }
    drop(bus);

    assert_eq!(deleting, 1);
    assert_eq!(count(&fixture.provider.journal, &Call::DeleteSet), 1);
}

#[test]
fn test_events_carry_components_and_volumes() {
    let fixture = fixture();
    let mut seen = Vec::new();
    let mut observer = |event: &ProgressEvent<'_>| {
        if let ProgressEvent::SnapshotSetStarting(context) = event {
            seen.push((context.components.clone(), context.volumes.len()));
        }
        Flow::Continue
    };
    let mut bus = ProgressBus::new(Some(&mut observer));
    let subsystem = fixture.provider.create().unwrap();
    let mut coordinator = SnapshotCoordinator::new(subsystem, &NoClusterVolumes, &mut bus);

    coordinator.initialize().unwrap();
    coordinator.gather_metadata().unwrap();
    coordinator.register_components(&requested()).unwrap();
    coordinator.create_set().unwrap();
    coordinator.teardown().unwrap();
    drop(coordinator);
    drop(bus);

    assert_eq!(seen, vec![(requested(), 1)]);
}

struct SharedVolume;

impl ClusterVolumes for SharedVolume {
    fn is_supported(&self) -> bool {
        true
    }

    fn is_path_on_shared_volume(&self, path: &str) -> bool {
        path.to_lowercase().starts_with("c:\\hyper-v\\")
    }

    fn prepare_shared_volume_for_backup(&self, _path: &str) -> SnapshotResult<(String, String)> {
        Ok(("C:\\Hyper-V\\".to_string(), "\\\\?\\Volume{csv}\\".to_string()))
    }
}

#[test]
fn test_shared_volume_names_are_snapshotted() {
    let mut fixture = fixture();
    fixture
        .provider
        .roots
        .push(("\\\\?\\Volume{csv}\\".to_string(), fixture.snapshot.path().join("Hyper-V")));

    let mut bus = ProgressBus::silent();
    let subsystem = fixture.provider.create().unwrap();
    let mut coordinator = SnapshotCoordinator::new(subsystem, &SharedVolume, &mut bus);

    coordinator.initialize().unwrap();
    coordinator.gather_metadata().unwrap();
    coordinator.register_components(&requested()).unwrap();
    assert_eq!(coordinator.volumes().len(), 1);
    coordinator.create_set().unwrap();

    let view = coordinator.resolve_snapshot_paths().unwrap();
    let (volume, device) = view
        .locate("C:\\Hyper-V\\app01\\Virtual Hard Disks\\disk.vhdx")
        .unwrap();
    assert_eq!(volume.path, "C:\\Hyper-V\\");
    assert_eq!(device, fixture.snapshot.path().join("Hyper-V"));
    coordinator.teardown().unwrap();
    drop(coordinator);

    assert_eq!(
        count(
            &fixture.provider.journal,
            &Call::AddVolume("\\\\?\\Volume{csv}\\".to_string())
        ),
        1
    );
}
