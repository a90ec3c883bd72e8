//! Compressed archive output.
//!
//! Two backends share one sink:
//! - zip: deflate (or stored at level 0), ZIP64 for large entries, optional
//!   WinZip AES-256 encryption;
//! - tar-zstd: a tar stream through a zstd encoder, optionally multithreaded,
//!   and sealed with [`EncryptWriter`] when a password is set.
//!
//! Entries are streamed one at a time through a [`ProgressReader`], so files are
//! never loaded whole and every progress callback is a cancellation point.

use crate::config::{BackupOptions, OutputMode};
use crate::fs::SelectedEntry;
use crate::output::crypt::EncryptWriter;
use crate::progress::reader::is_cancellation;
use crate::progress::{EventContext, ProgressBus, ProgressEvent, ProgressReader};
use crate::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

type TarZstdBuilder = tar::Builder<zstd::stream::write::Encoder<'static, TarTarget>>;

/// Destination of the zstd stream.
enum TarTarget {
    Plain(File),
    Encrypted(EncryptWriter<File>),
}

impl TarTarget {
    fn finish(self) -> io::Result<File> {
        match self {
            TarTarget::Plain(file) => Ok(file),
            TarTarget::Encrypted(writer) => writer.finish(),
        }
    }
}

impl Write for TarTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarTarget::Plain(file) => file.write(buf),
            TarTarget::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarTarget::Plain(file) => file.flush(),
            TarTarget::Encrypted(writer) => writer.flush(),
        }
    }
}

/// zstd compression tiers behind the 0-9 level dial.
///
/// | dial | tier   | zstd level |
/// |------|--------|------------|
/// | 0    | None   | 1          |
/// | 1-2  | Fast   | 2          |
/// | 3-5  | Low    | 4          |
/// | 6    | Normal | 9          |
/// | 7-8  | High   | 15         |
/// | 9    | Ultra  | 19         |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZstdTier {
    None,
    Fast,
    Low,
    Normal,
    High,
    Ultra,
}

impl ZstdTier {
    pub fn from_dial(level: u32) -> Self {
        match level {
            0 => ZstdTier::None,
            1..=2 => ZstdTier::Fast,
            3..=5 => ZstdTier::Low,
            6 => ZstdTier::Normal,
            7..=8 => ZstdTier::High,
            _ => ZstdTier::Ultra,
        }
    }

    pub fn zstd_level(self) -> i32 {
        match self {
            ZstdTier::None => 1,
            ZstdTier::Fast => 2,
            ZstdTier::Low => 4,
            ZstdTier::Normal => 9,
            ZstdTier::High => 15,
            ZstdTier::Ultra => 19,
        }
    }
}

enum ArchiveWriter {
    Zip(ZipWriter<File>),
    TarZstd(TarZstdBuilder),
}

pub struct ArchiveSink {
    path: PathBuf,
    writer: ArchiveWriter,
    level: u32,
    password: Option<String>,
    /// Bytes of all entries of the component
    total_bytes: u64,
    written_bytes: u64,
}

impl ArchiveSink {
    /// Create the archive at `path`, replacing any existing file.
    pub fn create(path: PathBuf, options: &BackupOptions, total_bytes: u64) -> Result<Self> {
        match fs::remove_file(&path) {
            Ok(()) => info!("Replacing existing archive {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackupError::output(path, e)),
        }

        let level = options.effective_level();
        let file = File::create(&path).map_err(|e| BackupError::output(&path, e))?;

        let writer = match options.output {
            OutputMode::TarZstd => {
                let password = options.password();
                let builder = tar_zstd_builder(file, level, options.multithread, password)
                    .map_err(|e| BackupError::output(&path, e));
                match builder {
                    Ok(builder) => ArchiveWriter::TarZstd(builder),
                    Err(e) => {
                        remove_partial(&path);
                        return Err(e);
                    }
                }
            }
            OutputMode::Zip | OutputMode::DirectCopy => ArchiveWriter::Zip(ZipWriter::new(file)),
        };

        debug!("Archive {} opened (level {})", path.display(), level);
        Ok(Self {
            path,
            writer,
            level,
            password: options.password().map(str::to_string),
            total_bytes,
            written_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream one entry into the archive. The entry's file is closed on return.
    pub fn write_entry(
        &mut self,
        mut entry: SelectedEntry,
        context: &EventContext,
        bus: &mut ProgressBus<'_>,
    ) -> Result<()> {
        let archive = self.path.as_path();
        let name = entry.archive_path.as_str();
        let size = entry.size;

        let written = match &mut self.writer {
            ArchiveWriter::Zip(zip) => {
                let base = SimpleFileOptions::default()
                    .compression_method(if self.level == 0 {
                        CompressionMethod::Stored
                    } else {
                        CompressionMethod::Deflated
                    })
                    .compression_level(if self.level == 0 {
                        None
                    } else {
                        Some(i64::from(self.level))
                    })
                    .large_file(size >= u64::from(u32::MAX));

                let started = match self.password.as_deref() {
                    Some(password) => {
                        zip.start_file(name, base.with_aes_encryption(AesMode::Aes256, password))
                    }
                    None => zip.start_file(name, base),
                };
                started.map_err(|e| zip_error(archive, e))?;

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
                    io::copy(&mut reader, zip)
                };
                copied.map_err(|e| io_error(archive, e, bus))?
            }
            ArchiveWriter::TarZstd(builder) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(size);
                header.set_mode(0o644);
                header.set_mtime(modified_secs(&entry.file));
                header.set_entry_type(tar::EntryType::Regular);

                let done = self.written_bytes;
                let total = self.total_bytes;
                let appended = {
                    let reader = ProgressReader::new((&mut entry.file).take(size), |bytes| {
                        bus.notify(&ProgressEvent::PercentProgress {
                            context,
                            archive,
                            entry: name,
                            percent: percent(done + bytes, total),
                        })
                    });
                    builder.append_data(&mut header, name, reader)
                };
                appended.map_err(|e| io_error(archive, e, bus))?;
                size
            }
        };

        self.written_bytes += written;
        debug!("Added {} ({} bytes) to {}", name, written, archive.display());
        Ok(())
    }

    /// Write the archive trailer and close the file.
    pub fn finish(self) -> Result<PathBuf> {
        let path = self.path;
        let finished = match self.writer {
            ArchiveWriter::Zip(zip) => zip
                .finish()
                .map_err(|e| zip_error(&path, e))
                .and_then(|file| file.sync_all().map_err(|e| BackupError::output(&path, e))),
            ArchiveWriter::TarZstd(builder) => builder
                .into_inner()
                .and_then(|encoder| encoder.finish())
                .and_then(TarTarget::finish)
                .and_then(|file| file.sync_all())
                .map_err(|e| BackupError::output(&path, e)),
        };

        match finished {
            Ok(()) => {
                info!("Archive {} written", path.display());
                Ok(path)
            }
            Err(e) => {
                remove_partial(&path);
                Err(e)
            }
        }
    }

    /// Drop the writer and delete the partial archive.
    pub fn abort(self) {
        let path = self.path;
        drop(self.writer);
        remove_partial(&path);
    }
}

fn tar_zstd_builder(
    file: File,
    level: u32,
    multithread: bool,
    password: Option<&str>,
) -> io::Result<TarZstdBuilder> {
    let target = match password {
        Some(password) => TarTarget::Encrypted(EncryptWriter::new(file, password)?),
        None => TarTarget::Plain(file),
    };

    let mut encoder =
        zstd::stream::write::Encoder::new(target, ZstdTier::from_dial(level).zstd_level())?;
    encoder.include_checksum(true)?;
    if multithread {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        encoder.multithread(workers)?;
        debug!("zstd using {} worker threads", workers);
    }
    Ok(tar::Builder::new(encoder))
}

fn modified_secs(file: &File) -> u64 {
    file.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

fn io_error(path: &Path, e: io::Error, bus: &ProgressBus<'_>) -> BackupError {
    if bus.is_cancelled() || is_cancellation(&e) {
        BackupError::Cancelled
    } else {
        BackupError::output(path, e)
    }
}

fn zip_error(path: &Path, e: ZipError) -> BackupError {
    match e {
        ZipError::Io(e) if is_cancellation(&e) => BackupError::Cancelled,
        source => BackupError::Archive {
            path: path.to_path_buf(),
            source,
        },
    }
}

pub(crate) fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed partial archive {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial archive {}: {}", path.display(), e),
    }
}
