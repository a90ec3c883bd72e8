//! Output pipeline: one archive or folder per component.

pub mod archive;
pub mod crypt;
pub mod direct;
pub mod naming;

use crate::config::{BackupOptions, OutputMode};
use crate::fs::SelectedEntry;
use crate::progress::{EventContext, ProgressBus, ProgressEvent};
use crate::Result;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

pub use archive::{ArchiveSink, ZstdTier};
pub use crypt::{DecryptReader, EncryptWriter};
pub use direct::DirectCopySink;
pub use naming::NameTemplate;

pub enum OutputSink {
    Archive(ArchiveSink),
    DirectCopy(DirectCopySink),
}

impl OutputSink {
    /// Open the output of component `id` named `name`.
    pub fn start(
        options: &BackupOptions,
        id: &str,
        name: &str,
        at: NaiveDateTime,
        total_bytes: u64,
    ) -> Result<Self> {
        let template = NameTemplate::parse(&options.name_template)?;
        let file_name = template.render(name, id, at, options.extension())?;
        let path = options.output_dir.join(file_name);

        match options.output {
            OutputMode::DirectCopy => Ok(OutputSink::DirectCopy(DirectCopySink::create(path))),
            OutputMode::Zip | OutputMode::TarZstd => Ok(OutputSink::Archive(ArchiveSink::create(
                path,
                options,
                total_bytes,
            )?)),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            OutputSink::Archive(sink) => sink.path(),
            OutputSink::DirectCopy(sink) => sink.path(),
        }
    }

    pub fn write_entry(
        &mut self,
        entry: SelectedEntry,
        context: &EventContext,
        bus: &mut ProgressBus<'_>,
    ) -> Result<()> {
        match self {
            OutputSink::Archive(sink) => sink.write_entry(entry, context, bus),
            OutputSink::DirectCopy(sink) => sink.write_entry(entry, context, bus),
        }
    }

    pub fn finish(self) -> Result<PathBuf> {
        match self {
            OutputSink::Archive(sink) => sink.finish(),
            OutputSink::DirectCopy(sink) => sink.finish(),
        }
    }

    /// Discard whatever was written so far.
    pub fn abort(self) {
        match self {
            OutputSink::Archive(sink) => sink.abort(),
            OutputSink::DirectCopy(sink) => sink.abort(),
        }
    }
}

/// Write every entry of one component; on failure or cancellation the partial
/// output is removed before the error is returned.
pub fn write_component(
    options: &BackupOptions,
    id: &str,
    name: &str,
    at: NaiveDateTime,
    entries: Vec<SelectedEntry>,
    context: &EventContext,
    bus: &mut ProgressBus<'_>,
) -> Result<PathBuf> {
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
    let mut sink = OutputSink::start(options, id, name, at, total_bytes)?;

    if let Err(e) = write_entries(&mut sink, entries, context, bus) {
        sink.abort();
        return Err(e);
    }

    let path = sink.finish()?;
    bus.emit(&ProgressEvent::ArchiveDone {
        context,
        archive: &path,
    })?;
    Ok(path)
}

fn write_entries(
    sink: &mut OutputSink,
    entries: Vec<SelectedEntry>,
    context: &EventContext,
    bus: &mut ProgressBus<'_>,
) -> Result<()> {
    bus.emit(&ProgressEvent::ArchiveStarting {
        context,
        archive: sink.path(),
    })?;

    let entries_total = entries.len();
    for entry in entries {
        bus.emit(&ProgressEvent::EntryStarting {
            context,
            archive: sink.path(),
            entry: &entry.archive_path,
            entries_total,
        })?;
        sink.write_entry(entry, context, bus)?;
    }
    Ok(())
}
