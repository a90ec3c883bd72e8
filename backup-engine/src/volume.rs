//! Volume resolution for manifest paths.
//!
//! Manifest paths come from the writer metadata in Windows form
//! (`C:\Hyper-V\vm\disk.vhdx`); both `\` and `/` are accepted as separators.
//! Volume paths are matched case-insensitively and the longest prefix wins.

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};

/// A volume taking part in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Root prefix of the paths living on this volume
    pub path: String,

    /// Name handed to the snapshot subsystem (differs from `path` on shared volumes)
    pub name: String,
}

impl Volume {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }

    /// Volume-relative remainder of `path`, or None if the volume does not own it.
    pub fn relative<'p>(&self, path: &'p str) -> Option<&'p str> {
        strip_prefix_ignore_case(path, &self.path)
            .map(|rest| rest.trim_start_matches(is_separator))
    }
}

/// Volumes discovered for a run, keyed case-insensitively by path.
/// Insertion order is kept; the first mapping for a path wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeMap {
    volumes: Vec<Volume>,
}

impl VolumeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a volume; returns false if its path was already known.
    pub fn insert(&mut self, volume: Volume) -> bool {
        if self.get(&volume.path).is_some() {
            return false;
        }
        self.volumes.push(volume);
        true
    }

    pub fn get(&self, path: &str) -> Option<&Volume> {
        self.volumes
            .iter()
            .find(|v| v.path.len() == path.len() && strip_prefix_ignore_case(path, &v.path).is_some())
    }

    /// Distinct volume names, in discovery order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for volume in &self.volumes {
            if !names.contains(&volume.name.as_str()) {
                names.push(&volume.name);
            }
        }
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Owning volume of `path` (see [`resolve`]).
    pub fn resolve(&self, path: &str) -> Result<&Volume> {
        resolve(path, &self.volumes)
    }
}

/// Pick the volume whose path is the longest case-insensitive prefix of `path`.
pub fn resolve<'v>(path: &str, volumes: &'v [Volume]) -> Result<&'v Volume> {
    volumes
        .iter()
        .filter(|v| strip_prefix_ignore_case(path, &v.path).is_some())
        .max_by_key(|v| v.path.len())
        .ok_or_else(|| BackupError::NoMatchingVolume {
            path: path.to_string(),
        })
}

/// Root of a Windows or Unix path: `C:\`, `\\server\share\`, `/`.
/// Drive letters are upper-cased.
pub fn path_root(path: &str) -> String {
    let bytes = path.as_bytes();

    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_uppercase();
        return match bytes.get(2) {
            Some(&c) if is_separator(c as char) => format!("{}:{}", drive, c as char),
            _ => format!("{}:", drive),
        };
    }

    if path.starts_with("\\\\") || path.starts_with("//") {
        // UNC: \\server\share\
        let mut seen = 0;
        for (idx, c) in path.char_indices().skip(2) {
            if is_separator(c) {
                seen += 1;
                if seen == 2 {
                    return path[..=idx].to_uppercase();
                }
            }
        }
        return path.to_uppercase();
    }

    match path.chars().next() {
        Some(c) if is_separator(c) => c.to_string(),
        _ => String::new(),
    }
}

pub fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// Non-empty path segments, splitting on both separators.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(is_separator).filter(|s| !s.is_empty())
}

/// Whether `path` has a `..` segment, which would step out of its root.
pub fn has_parent_segment(path: &str) -> bool {
    segments(path).any(|s| s == "..")
}

/// Last segment of a path.
pub fn file_name(path: &str) -> &str {
    segments(path).last().unwrap_or("")
}

/// Join a directory and a file specification with a backslash, as the writer does.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with(is_separator) {
        format!("{}{}", dir, name)
    } else {
        format!("{}\\{}", dir, name)
    }
}

/// Remainder of `path` after `prefix`, comparing characters case-insensitively.
pub fn strip_prefix_ignore_case<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    let mut path_chars = path.char_indices();
    for p in prefix.chars() {
        let (_, c) = path_chars.next()?;
        if !c.to_lowercase().eq(p.to_lowercase()) {
            return None;
        }
    }
    let offset = path_chars.next().map(|(idx, _)| idx).unwrap_or(path.len());
    Some(&path[offset..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volumes() -> Vec<Volume> {
        vec![
            Volume::new("C:\\", "C:\\"),
            Volume::new("C:\\ClusterStorage\\Volume1\\", "\\\\?\\Volume{1111}\\"),
            Volume::new("D:\\", "D:\\"),
        ]
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let volumes = volumes();
        let v = resolve("C:\\ClusterStorage\\Volume1\\vm\\disk.vhdx", &volumes).unwrap();
        assert_eq!(v.path, "C:\\ClusterStorage\\Volume1\\");

        let v = resolve("C:\\Hyper-V\\disk.vhdx", &volumes).unwrap();
        assert_eq!(v.path, "C:\\");
    }

    #[test]
    fn test_resolve_ignores_case() {
        let volumes = volumes();
        let v = resolve("c:\\clusterstorage\\VOLUME1\\vm\\disk.vhdx", &volumes).unwrap();
        assert_eq!(v.name, "\\\\?\\Volume{1111}\\");
    }

    #[test]
    fn test_resolve_no_match() {
        let volumes = volumes();
        let err = resolve("E:\\vm\\disk.vhdx", &volumes).unwrap_err();
        assert!(matches!(err, BackupError::NoMatchingVolume { .. }));
    }

    #[test]
    fn test_resolve_is_order_independent() {
        let mut volumes = volumes();
        volumes.reverse();
        let v = resolve("C:\\ClusterStorage\\Volume1\\x", &volumes).unwrap();
        assert_eq!(v.path, "C:\\ClusterStorage\\Volume1\\");
    }

    #[test]
    fn test_path_root() {
        assert_eq!(path_root("c:\\Hyper-V\\vm"), "C:\\");
        assert_eq!(path_root("D:"), "D:");
        assert_eq!(path_root("\\\\server\\share\\vm\\disk.vhdx"), "\\\\SERVER\\SHARE\\");
        assert_eq!(path_root("/var/lib/vm"), "/");
        assert_eq!(path_root("relative\\path"), "");
    }

    #[test]
    fn test_volume_map_dedupes_case_insensitively() {
        let mut map = VolumeMap::new();
        assert!(map.insert(Volume::new("C:\\", "C:\\")));
        assert!(!map.insert(Volume::new("c:\\", "c:\\")));
        assert!(map.insert(Volume::new("E:\\", "\\\\?\\Volume{2}\\")));
        assert!(map.insert(Volume::new("F:\\", "\\\\?\\Volume{2}\\")));
        assert_eq!(map.len(), 3);
        assert_eq!(map.names(), vec!["C:\\", "\\\\?\\Volume{2}\\"]);
    }

    #[test]
    fn test_relative_and_segments() {
        let volume = Volume::new("C:\\", "C:\\");
        let rel = volume.relative("c:\\Hyper-V\\vm1\\Virtual Hard Disks\\disk.vhdx").unwrap();
        assert_eq!(rel, "Hyper-V\\vm1\\Virtual Hard Disks\\disk.vhdx");
        assert_eq!(
            segments(rel).collect::<Vec<_>>(),
            vec!["Hyper-V", "vm1", "Virtual Hard Disks", "disk.vhdx"]
        );
        assert_eq!(file_name(rel), "disk.vhdx");
        assert!(!has_parent_segment(rel));
        assert!(has_parent_segment("C:\\VMs\\..\\Windows\\system.ini"));
        assert!(has_parent_segment("VMs/../../etc/passwd"));
        assert!(!has_parent_segment("VMs/disk..vhdx"));
        assert!(volume.relative("D:\\other").is_none());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("C:\\vm", "a.xml"), "C:\\vm\\a.xml");
        assert_eq!(join("C:\\vm\\", "a.xml"), "C:\\vm\\a.xml");
        assert_eq!(join("", "a.xml"), "a.xml");
    }
}
