//! Inclusion rules for manifest paths.

use crate::volume::{file_name, strip_prefix_ignore_case};

/// Folder the hypervisor keeps its own checkpoint data in.
pub const SNAPSHOT_FOLDER: &str = "Snapshots";

/// Decides which manifest paths are backed up.
#[derive(Debug, Clone, Default)]
pub struct FileSelector {
    include: Vec<String>,
    ignore: Vec<String>,
}

impl FileSelector {
    pub fn new(include: &[String], ignore: &[String]) -> Self {
        Self {
            include: include.iter().map(|n| n.to_uppercase()).collect(),
            ignore: ignore.iter().map(|n| n.to_uppercase()).collect(),
        }
    }

    /// Whether `path` (owned by the volume at `volume_path`) is backed up.
    ///
    /// Rules, first failing rule wins:
    /// 1. wildcard folder entries (`...\*`) are skipped
    /// 2. anything directly inside a `Snapshots` folder is skipped
    /// 3. a non-empty include list must name the file
    /// 4. a non-empty ignore list must not name the file
    pub fn is_included(&self, path: &str, volume_path: &str) -> bool {
        if path.ends_with("\\*") || path.ends_with("/*") {
            return false;
        }

        let parts: Vec<&str> = path.split(['\\', '/']).collect();
        if parts.len() >= 2 && parts[parts.len() - 2].eq_ignore_ascii_case(SNAPSHOT_FOLDER) {
            return false;
        }

        let relative = strip_prefix_ignore_case(path, volume_path).unwrap_or(path);
        let name = file_name(relative).to_uppercase();

        if !self.include.is_empty() && !self.include.iter().any(|n| *n == name) {
            return false;
        }

        if !self.ignore.is_empty() && self.ignore.iter().any(|n| *n == name) {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wildcard_folder_excluded() {
        let selector = FileSelector::default();
        assert!(!selector.is_included("C:\\Hyper-V\\vm1\\Virtual Machines\\GUID\\*", "C:\\"));
        assert!(selector.is_included("C:\\Hyper-V\\vm1\\Virtual Machines\\GUID.vmcx", "C:\\"));
    }

    #[test]
    fn test_snapshot_folder_excluded() {
        let selector = FileSelector::default();
        assert!(!selector.is_included("C:\\Hyper-V\\vm1\\Snapshots\\A1B2.vmcx", "C:\\"));
        assert!(!selector.is_included("C:\\Hyper-V\\vm1\\snapshots\\A1B2.vmrs", "C:\\"));
        // only the direct parent counts
        assert!(selector.is_included("C:\\Hyper-V\\Snapshots\\vm1\\disk.vhdx", "C:\\"));
    }

    #[test]
    fn test_include_list() {
        let selector = FileSelector::new(&names(&["os.vhdx"]), &[]);
        assert!(selector.is_included("C:\\VMs\\vm1\\OS.VHDX", "C:\\"));
        assert!(!selector.is_included("C:\\VMs\\vm1\\data.vhdx", "C:\\"));
    }

    #[test]
    fn test_ignore_list() {
        let selector = FileSelector::new(&[], &names(&["Data.vhdx"]));
        assert!(!selector.is_included("C:\\VMs\\vm1\\data.VHDX", "C:\\"));
        assert!(selector.is_included("C:\\VMs\\vm1\\os.vhdx", "C:\\"));
    }

    #[test]
    fn test_include_then_ignore() {
        let selector = FileSelector::new(&names(&["os.vhdx", "data.vhdx"]), &names(&["data.vhdx"]));
        assert!(selector.is_included("C:\\VMs\\os.vhdx", "C:\\"));
        assert!(!selector.is_included("C:\\VMs\\data.vhdx", "C:\\"));
    }

    #[test]
    fn test_selection_is_idempotent() {
        let selector = FileSelector::new(&names(&["os.vhdx"]), &names(&["swap.vhdx"]));
        let paths = [
            "C:\\VMs\\os.vhdx",
            "C:\\VMs\\swap.vhdx",
            "C:\\VMs\\Snapshots\\x.vmcx",
            "C:\\VMs\\vm\\*",
        ];
        for path in paths {
            assert_eq!(selector.is_included(path, "C:\\"), selector.is_included(path, "C:\\"));
        }
    }
}
