//! Expansion of manifest paths into readable snapshot entries.
//!
//! A manifest path such as `C:\Hyper-V\vm1\Virtual Hard Disks` is rebased onto
//! the snapshot device of its volume. Files yield one entry; directories are
//! walked in file-name order. Every entry keeps its volume-relative path,
//! joined with `/`, as the name it is stored under.

use crate::snapshot::SnapshotView;
use crate::volume::{file_name, has_parent_segment, segments};
use crate::{BackupError, Result};
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Extensions of files the hypervisor may legitimately drop between metadata
/// collection and snapshot (saved state, checkpoint differencing disks).
pub const IGNORABLE_EXTENSIONS: &[&str] = &["avhdx", "vmrs", "bin", "vsv"];

/// A file read from the snapshot, owned by whoever writes it out.
#[derive(Debug)]
pub struct SelectedEntry {
    /// Volume-relative path with `/` separators
    pub archive_path: String,

    /// Location inside the snapshot
    pub source: PathBuf,

    pub size: u64,

    /// Open read stream; closed when the entry is dropped
    pub file: File,
}

impl SelectedEntry {
    fn open(source: PathBuf, archive_path: String) -> io::Result<Self> {
        let file = File::open(&source)?;
        let size = file.metadata()?.len();
        Ok(Self {
            archive_path,
            source,
            size,
            file,
        })
    }
}

/// Whether a missing `path` may be skipped.
pub fn is_ignorable(path: &str) -> bool {
    match file_name(path).rsplit_once('.') {
        Some((_, ext)) => IGNORABLE_EXTENSIONS
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

/// Open every file a manifest path refers to inside the snapshot.
pub fn expand(manifest_path: &str, view: &SnapshotView) -> Result<Vec<SelectedEntry>> {
    if has_parent_segment(manifest_path) {
        return Err(BackupError::UnsafePath {
            path: manifest_path.to_string(),
        });
    }

    let (volume, device) = view.locate(manifest_path)?;
    let relative: Vec<&str> = volume
        .relative(manifest_path)
        .map(|rest| segments(rest).collect())
        .unwrap_or_default();

    let source = relative
        .iter()
        .fold(device.to_path_buf(), |path, segment| path.join(segment));

    let metadata = match std::fs::metadata(&source) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if is_ignorable(manifest_path) {
                info!("Skipping {}, not present in snapshot", manifest_path);
                return Ok(Vec::new());
            }
            return Err(BackupError::MissingEntry {
                path: PathBuf::from(manifest_path),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_dir() {
        return Ok(vec![SelectedEntry::open(source, relative.join("/"))?]);
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(&source).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }

        let archive_path = archive_path(entry.path(), device);
        debug!("Found {} under {}", archive_path, manifest_path);
        entries.push(SelectedEntry::open(entry.path().to_path_buf(), archive_path)?);
    }

    Ok(entries)
}

/// Path of `path` relative to `root`, joined with `/`.
fn archive_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
