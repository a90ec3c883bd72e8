//! Virtual machine name lookup.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the requested keys are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    /// Display name of the VM
    #[default]
    ElementName,
    /// VM id (the writer component name)
    SystemName,
}

/// Maps requested VMs to `id -> display name`.
pub trait NameDirectory {
    /// Resolve `requested` keys (all VMs when empty), dropping every VM whose
    /// display name is in `exclude` (case-insensitive). Unknown keys are
    /// silently absent from the result.
    fn resolve(
        &self,
        requested: &[String],
        exclude: &[String],
        kind: KeyKind,
    ) -> Result<BTreeMap<String, String>>;
}

/// Whether the VM `(id, name)` is selected by `requested` under `kind`.
pub(crate) fn matches_request(id: &str, name: &str, requested: &[String], kind: KeyKind) -> bool {
    if requested.is_empty() {
        return true;
    }
    let key = match kind {
        KeyKind::ElementName => name,
        KeyKind::SystemName => id,
    };
    requested.iter().any(|r| r.eq_ignore_ascii_case(key))
}

pub(crate) fn is_excluded(name: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|e| e.eq_ignore_ascii_case(name))
}

/// In-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    vms: Vec<(String, String)>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.insert(id, name);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.vms.push((id.into(), name.into()));
    }
}

impl NameDirectory for StaticDirectory {
    fn resolve(
        &self,
        requested: &[String],
        exclude: &[String],
        kind: KeyKind,
    ) -> Result<BTreeMap<String, String>> {
        Ok(self
            .vms
            .iter()
            .filter(|(id, name)| matches_request(id, name, requested, kind))
            .filter(|(_, name)| !is_excluded(name, exclude))
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect())
    }
}
