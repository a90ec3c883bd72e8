//! Console progress output.

use hyperv_backup_engine::{Flow, ProgressEvent, ProgressObserver};
use std::io::{self, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_WIDTH: usize = 80;

/// Prints backup progress and turns a Ctrl+C request into a cancel answer.
///
/// Cancellation is only reported back on the next event, so a snapshot set
/// being created is never interrupted halfway.
pub struct ConsoleObserver {
    cancel: CancellationToken,
    /// Dots in a full progress bar
    width: usize,
    /// Dots already printed for the current entry
    printed: usize,
}

impl ConsoleObserver {
    pub fn new(cancel: CancellationToken) -> Self {
        let width = std::env::var("COLUMNS")
            .ok()
            .and_then(|c| c.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WIDTH);
        Self::with_width(cancel, width)
    }

    pub fn with_width(cancel: CancellationToken, width: usize) -> Self {
        Self {
            cancel,
            width,
            printed: 0,
        }
    }

    fn advance<W: Write>(&mut self, out: &mut W, target: usize, done: bool) -> io::Result<()> {
        let target = target.min(self.width);
        if target > self.printed {
            out.write_all(".".repeat(target - self.printed).as_bytes())?;
            self.printed = target;
        }
        if done {
            writeln!(out)?;
        }
        out.flush()
    }

    pub fn render<W: Write>(&mut self, event: &ProgressEvent<'_>, out: &mut W) -> io::Result<()> {
        match *event {
            ProgressEvent::SnapshotInitializing => writeln!(out, "Initializing snapshot subsystem")?,
            ProgressEvent::SnapshotSetStarting(context) => {
                writeln!(out)?;
                writeln!(out, "Starting snapshot set for:")?;
                for name in context.components.values() {
                    writeln!(out, "{}", name)?;
                }
                writeln!(out)?;
                writeln!(out, "Volumes:")?;
                for volume in &context.volumes {
                    writeln!(out, "{}", volume.path)?;
                }
            }
            ProgressEvent::SnapshotSetReady(_) => writeln!(out, "Snapshot set ready")?,
            ProgressEvent::SnapshotSetDeleting(_) => writeln!(out, "Deleting snapshot set")?,
            ProgressEvent::ArchiveStarting { context, archive } => {
                writeln!(out)?;
                for name in context.components.values() {
                    writeln!(out, "Component: \"{}\"", name)?;
                }
                writeln!(out, "Archive: \"{}\"", archive.display())?;
            }
            ProgressEvent::EntryStarting { entry, .. } => {
                writeln!(out, "Entry: \"{}\"", entry)?;
                self.printed = 0;
            }
            ProgressEvent::EntryProgress {
                bytes_transferred,
                total_bytes,
                ..
            } => {
                if total_bytes > 0 {
                    let target = (bytes_transferred.saturating_mul(self.width as u64) / total_bytes) as usize;
                    self.advance(out, target, bytes_transferred >= total_bytes)?;
                }
            }
            ProgressEvent::PercentProgress { percent, .. } => {
                let target = usize::from(percent) * self.width / 100;
                self.advance(out, target, percent >= 100)?;
            }
            ProgressEvent::ArchiveDone { archive, .. } => {
                let size = std::fs::metadata(archive).map(|m| m.len()).unwrap_or(0);
                if size > 0 {
                    writeln!(out, "Done: \"{}\" ({})", archive.display(), format_bytes(size))?;
                } else {
                    writeln!(out, "Done: \"{}\"", archive.display())?;
                }
            }
            ProgressEvent::EntryIgnored { path, .. } => writeln!(out, "Ignoring file {}", path)?,
        }
        Ok(())
    }
}

impl ProgressObserver for ConsoleObserver {
    fn on_event(&mut self, event: &ProgressEvent<'_>) -> Flow {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        // A closed stdout must not stop the backup.
        let _ = self.render(event, &mut out);

        if self.cancel.is_cancelled() {
            Flow::Cancel
        } else {
            Flow::Continue
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format an elapsed time as `hh:mm:ss.mmm`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}
