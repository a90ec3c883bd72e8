//! Backup manager - runs snapshot cycles and writes every component out.
//!
//! In single-snapshot mode all requested VMs share one snapshot set; otherwise
//! each VM gets its own cycle, in directory order. The first error or a
//! cancellation stops the run; any open snapshot set is deleted first.

use crate::config::BackupOptions;
use crate::directory::{KeyKind, NameDirectory};
use crate::fs::{expand, SelectedEntry};
use crate::output::write_component;
use crate::progress::{EventContext, ProgressBus, ProgressEvent, ProgressObserver};
use crate::selector::FileSelector;
use crate::snapshot::{
    ClusterVolumes, ComponentMetadata, NoClusterVolumes, SnapshotCoordinator, SnapshotProvider,
    SnapshotSubsystem, SnapshotView,
};
use crate::Result;
use chrono::Local;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupOutcome {
    /// VM id -> display name of every VM the directory resolved
    pub components: BTreeMap<String, String>,

    /// Archives or folders written
    pub outputs: Vec<PathBuf>,
}

impl BackupOutcome {
    /// Requested keys that matched no backed-up VM.
    pub fn missing(&self, requested: &[String], kind: KeyKind) -> Vec<String> {
        requested
            .iter()
            .filter(|key| {
                let found = match kind {
                    KeyKind::ElementName => {
                        self.components.values().any(|n| n.eq_ignore_ascii_case(key))
                    }
                    KeyKind::SystemName => {
                        self.components.keys().any(|id| id.eq_ignore_ascii_case(key))
                    }
                };
                !found
            })
            .cloned()
            .collect()
    }
}

pub struct BackupManager<P, C = NoClusterVolumes> {
    provider: P,
    cluster: C,
}

impl<P: SnapshotProvider> BackupManager<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cluster: NoClusterVolumes,
        }
    }
}

impl<P, C> BackupManager<P, C>
where
    P: SnapshotProvider,
    C: ClusterVolumes,
{
    /// Resolve shared volumes through `cluster`.
    pub fn with_cluster<K: ClusterVolumes>(self, cluster: K) -> BackupManager<P, K> {
        BackupManager {
            provider: self.provider,
            cluster,
        }
    }

    /// Back up the VMs `requested` (all when empty) as found by `directory`.
    pub fn run_backup(
        &self,
        directory: &dyn NameDirectory,
        requested: &[String],
        kind: KeyKind,
        options: &BackupOptions,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> Result<BackupOutcome> {
        options.validate()?;

        let vms = directory.resolve(requested, &options.exclude, kind)?;
        let mut outcome = BackupOutcome {
            components: vms,
            outputs: Vec::new(),
        };
        if outcome.components.is_empty() {
            warn!("No virtual machines to back up");
            return Ok(outcome);
        }

        info!(
            "Backing up {} virtual machines to {}",
            outcome.components.len(),
            options.output_dir.display()
        );

        let mut bus = ProgressBus::new(observer);
        let selector = FileSelector::new(&options.include, &options.ignore);

        if options.single_snapshot {
            let written = self.backup_subset(&outcome.components, options, &selector, &mut bus)?;
            outcome.outputs.extend(written);
        } else {
            for (id, name) in &outcome.components {
                let subset = BTreeMap::from([(id.clone(), name.clone())]);
                let written = self.backup_subset(&subset, options, &selector, &mut bus)?;
                outcome.outputs.extend(written);
            }
        }

        info!("Backup finished, {} outputs written", outcome.outputs.len());
        Ok(outcome)
    }

    /// One snapshot-set cycle over `vms`. Teardown runs whatever happens.
    fn backup_subset(
        &self,
        vms: &BTreeMap<String, String>,
        options: &BackupOptions,
        selector: &FileSelector,
        bus: &mut ProgressBus<'_>,
    ) -> Result<Vec<PathBuf>> {
        let subsystem = self.provider.create()?;
        let mut coordinator = SnapshotCoordinator::new(subsystem, &self.cluster, bus);

        let result = run_cycle(&mut coordinator, vms, options, selector);
        let teardown = coordinator.teardown();

        match (result, teardown) {
            (Ok(written), Ok(())) => Ok(written),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                if !cleanup.is_cancelled() {
                    error!("Snapshot set cleanup failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }
}

fn run_cycle<S: SnapshotSubsystem>(
    coordinator: &mut SnapshotCoordinator<'_, '_, S>,
    vms: &BTreeMap<String, String>,
    options: &BackupOptions,
    selector: &FileSelector,
) -> Result<Vec<PathBuf>> {
    coordinator.initialize()?;
    coordinator.gather_metadata()?;

    let registered = coordinator.register_components(vms)?.len();
    if registered == 0 {
        warn!(
            "None of {} is known to the Hyper-V writer",
            vms.values().cloned().collect::<Vec<_>>().join(", ")
        );
        return Ok(Vec::new());
    }

    coordinator.create_set()?;
    coordinator.resolve_snapshot_paths()?;

    let written = coordinator.read_files(|components, view, bus| {
        let mut written = Vec::with_capacity(components.len());
        for component in components {
            let name = display_name(vms, component);
            let context = EventContext {
                components: BTreeMap::from([(component.name.clone(), name.to_string())]),
                volumes: view.volumes().iter().cloned().collect(),
            };

            let entries = collect_entries(component, view, selector, &context, bus)?;
            info!("Writing {} ({} files)", name, entries.len());

            let at = Local::now().naive_local();
            let path = write_component(options, &component.name, name, at, entries, &context, bus)?;
            written.push(path);
        }
        Ok(written)
    })?;

    coordinator.mark_succeeded()?;
    coordinator.complete()?;
    Ok(written)
}

fn display_name<'a>(vms: &'a BTreeMap<String, String>, component: &'a ComponentMetadata) -> &'a str {
    vms.iter()
        .find(|(id, _)| id.eq_ignore_ascii_case(&component.name))
        .map(|(_, name)| name.as_str())
        .unwrap_or(&component.caption)
}

/// Open every selected file of `component` inside the snapshot.
fn collect_entries(
    component: &ComponentMetadata,
    view: &SnapshotView,
    selector: &FileSelector,
    context: &EventContext,
    bus: &mut ProgressBus<'_>,
) -> Result<Vec<SelectedEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for file in &component.files {
        let path = file.manifest_path();
        let volume = view.volumes().resolve(&path)?;

        if !selector.is_included(&path, &volume.path) {
            info!("Ignoring file {}", path);
            bus.emit(&ProgressEvent::EntryIgnored {
                context,
                path: &path,
            })?;
            continue;
        }

        for entry in expand(&path, view)? {
            if seen.insert(entry.archive_path.to_lowercase()) {
                entries.push(entry);
            } else {
                debug!("{} listed twice, keeping the first", entry.archive_path);
            }
        }
    }

    Ok(entries)
}
