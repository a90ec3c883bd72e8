//! Uncompressed copy of a component's files into a folder.

use crate::fs::SelectedEntry;
use crate::progress::reader::is_cancellation;
use crate::progress::{EventContext, ProgressBus, ProgressEvent, ProgressReader};
use crate::volume::{has_parent_segment, segments};
use crate::{BackupError, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct DirectCopySink {
    root: PathBuf,
    /// Files created (or truncated) by this run, in creation order
    files: Vec<PathBuf>,
    /// Folders created by this run, parents before children
    dirs: Vec<PathBuf>,
}

impl DirectCopySink {
    /// Prepare a copy into `root`. Nothing is created until the first entry.
    pub fn create(root: PathBuf) -> Self {
        if root.exists() {
            info!("Copying into existing folder {}", root.display());
        }
        Self {
            root,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create the missing folders between `root` and `dir`, remembering each one.
    fn create_dirs(&mut self, dir: &Path) -> Result<()> {
        let mut missing: Vec<PathBuf> = Vec::new();
        for ancestor in dir.ancestors() {
            if ancestor.exists() {
                break;
            }
            missing.push(ancestor.to_path_buf());
            if ancestor == self.root {
                break;
            }
        }

        for dir in missing.into_iter().rev() {
            match fs::create_dir(&dir) {
                Ok(()) => self.dirs.push(dir),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(BackupError::output(dir, e)),
            }
        }
        Ok(())
    }

    pub fn write_entry(
        &mut self,
        mut entry: SelectedEntry,
        context: &EventContext,
        bus: &mut ProgressBus<'_>,
    ) -> Result<()> {
        if has_parent_segment(&entry.archive_path) {
            return Err(BackupError::UnsafePath {
                path: entry.archive_path,
            });
        }

        let target = segments(&entry.archive_path)
            .fold(self.root.clone(), |path, segment| path.join(segment));
        if let Some(parent) = target.parent() {
            self.create_dirs(parent)?;
        }

        let mut out = File::create(&target).map_err(|e| BackupError::output(&target, e))?;
        self.files.push(target.clone());

        let archive = self.root.as_path();
        let name = entry.archive_path.as_str();
        let size = entry.size;

        let copied = {
            let mut reader = ProgressReader::new(&mut entry.file, |bytes| {
                bus.notify(&ProgressEvent::EntryProgress {
                    context,
                    archive,
                    entry: name,
                    bytes_transferred: bytes,
                    total_bytes: size,
                })
            });
            io::copy(&mut reader, &mut out)
        };

        match copied {
            Ok(bytes) => {
                debug!("Copied {} ({} bytes)", target.display(), bytes);
                Ok(())
            }
            Err(e) if bus.is_cancelled() || is_cancellation(&e) => Err(BackupError::Cancelled),
            Err(e) => Err(BackupError::output(&target, e)),
        }
    }

    pub fn finish(self) -> Result<PathBuf> {
        info!("Copy {} written", self.root.display());
        Ok(self.root)
    }

    /// Remove every file and folder this run created. Content that was already
    /// in the folder stays untouched.
    pub fn abort(self) {
        for file in self.files.iter().rev() {
            match fs::remove_file(file) {
                Ok(()) => debug!("Removed partial copy {}", file.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove partial copy {}: {}", file.display(), e),
            }
        }

        for dir in self.dirs.iter().rev() {
            match fs::remove_dir(dir) {
                Ok(()) => debug!("Removed folder {}", dir.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove folder {}: {}", dir.display(), e),
            }
        }
    }
}
