//! Backup options.
//!
//! Loaded from a TOML file or built in code; every field has a default so a
//! partial file is enough.

use crate::output::naming::NameTemplate;
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where and how each component is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Zip archive (deflate, optional AES-256 password)
    #[default]
    Zip,
    /// Tar stream compressed with zstd (optionally multithreaded, optional
    /// AES-256-GCM password)
    TarZstd,
    /// Uncompressed copy of the directory tree
    DirectCopy,
}

impl OutputMode {
    /// File extension appended through the `{ext}` template placeholder.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputMode::Zip => ".zip",
            OutputMode::TarZstd => ".tar.zst",
            OutputMode::DirectCopy => "",
        }
    }

    /// Level used when the configured compression level is -1.
    pub fn default_level(&self) -> u32 {
        match self {
            OutputMode::Zip => 6,
            OutputMode::TarZstd => 3,
            OutputMode::DirectCopy => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Folder receiving archives / copies
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Archive name template: {name}, {id}, {timestamp[:strftime]}, {ext}
    #[serde(default = "default_name_template")]
    pub name_template: String,

    /// Capture all requested VMs with one snapshot set
    #[serde(default)]
    pub single_snapshot: bool,

    /// File names to back up (empty = all)
    #[serde(default)]
    pub include: Vec<String>,

    /// File names to skip
    #[serde(default)]
    pub ignore: Vec<String>,

    /// VM display names never backed up
    #[serde(default)]
    pub exclude: Vec<String>,

    /// 0 (store) to 9 (max), -1 for the output format's default
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    #[serde(default)]
    pub output: OutputMode,

    #[serde(default)]
    pub password: Option<String>,

    /// Let the compression backend use several threads
    #[serde(default)]
    pub multithread: bool,
}

// Default values
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_name_template() -> String {
    "{name}_{timestamp}{ext}".to_string()
}

fn default_compression_level() -> i32 {
    -1
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            name_template: default_name_template(),
            single_snapshot: false,
            include: Vec::new(),
            ignore: Vec::new(),
            exclude: Vec::new(),
            compression_level: default_compression_level(),
            output: OutputMode::default(),
            password: None,
            multithread: false,
        }
    }
}

impl BackupOptions {
    /// Load options from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Check the options against each other and the chosen output mode.
    pub fn validate(&self) -> Result<()> {
        if !(-1..=9).contains(&self.compression_level) {
            return Err(BackupError::Config(format!(
                "compression level must be between 0 and 9 (or -1), got {}",
                self.compression_level
            )));
        }

        NameTemplate::parse(&self.name_template)?;

        if self.password().is_some() && self.output == OutputMode::DirectCopy {
            return Err(BackupError::Config(
                "password protection is not available with direct copy".to_string(),
            ));
        }

        if self.multithread && self.output != OutputMode::TarZstd {
            warn!("Multithreaded compression is only supported by tar-zstd, ignoring");
        }

        Ok(())
    }

    /// Extension of the output; encrypted tar-zstd streams get `.enc` appended.
    pub fn extension(&self) -> &'static str {
        match (self.output, self.password()) {
            (OutputMode::TarZstd, Some(_)) => ".tar.zst.enc",
            (mode, _) => mode.extension(),
        }
    }

    /// Password, treating an empty string as none.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Compression level on the 0-9 dial after applying the format default.
    pub fn effective_level(&self) -> u32 {
        if self.compression_level < 0 {
            self.output.default_level()
        } else {
            self.compression_level.min(9) as u32
        }
    }
}
