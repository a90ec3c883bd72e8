//! Snapshot-side file discovery.

pub mod expand;

pub use expand::{expand, is_ignorable, SelectedEntry, IGNORABLE_EXTENSIONS};
