//! Progress reporting and cooperative cancellation.
//!
//! Every stage of a backup run reports a [`ProgressEvent`] to at most one
//! [`ProgressObserver`] before continuing. The observer answers with a [`Flow`];
//! a single `Cancel` answer is remembered for the rest of the run, so any
//! checkpoint can stop the whole backup.

pub mod reader;

use crate::volume::Volume;
use crate::{BackupError, Result};
use std::collections::BTreeMap;
use std::path::Path;

pub use reader::ProgressReader;

/// Observer's answer to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    Cancel,
}

/// Components and volumes an event refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// Component id -> caption
    pub components: BTreeMap<String, String>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent<'a> {
    SnapshotInitializing,
    SnapshotSetStarting(&'a EventContext),
    SnapshotSetReady(&'a EventContext),
    SnapshotSetDeleting(&'a EventContext),
    ArchiveStarting {
        context: &'a EventContext,
        archive: &'a Path,
    },
    EntryStarting {
        context: &'a EventContext,
        archive: &'a Path,
        entry: &'a str,
        entries_total: usize,
    },
    EntryProgress {
        context: &'a EventContext,
        archive: &'a Path,
        entry: &'a str,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    ArchiveDone {
        context: &'a EventContext,
        archive: &'a Path,
    },
    PercentProgress {
        context: &'a EventContext,
        archive: &'a Path,
        entry: &'a str,
        percent: u8,
    },
    /// A manifest path was left out by the file selector
    EntryIgnored {
        context: &'a EventContext,
        path: &'a str,
    },
}

impl ProgressEvent<'_> {
    pub fn context(&self) -> Option<&EventContext> {
        match *self {
            ProgressEvent::SnapshotInitializing => None,
            ProgressEvent::SnapshotSetStarting(context)
            | ProgressEvent::SnapshotSetReady(context)
            | ProgressEvent::SnapshotSetDeleting(context)
            | ProgressEvent::ArchiveStarting { context, .. }
            | ProgressEvent::EntryStarting { context, .. }
            | ProgressEvent::EntryProgress { context, .. }
            | ProgressEvent::ArchiveDone { context, .. }
            | ProgressEvent::PercentProgress { context, .. }
            | ProgressEvent::EntryIgnored { context, .. } => Some(context),
        }
    }
}

/// Receives progress events and decides whether the run goes on.
pub trait ProgressObserver {
    fn on_event(&mut self, event: &ProgressEvent<'_>) -> Flow;
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ProgressEvent<'_>) -> Flow,
{
    fn on_event(&mut self, event: &ProgressEvent<'_>) -> Flow {
        self(event)
    }
}

/// Synchronous hook between the engine and its (optional) observer.
pub struct ProgressBus<'o> {
    observer: Option<&'o mut dyn ProgressObserver>,
    cancelled: bool,
}

impl<'o> ProgressBus<'o> {
    pub fn new(observer: Option<&'o mut dyn ProgressObserver>) -> Self {
        Self {
            observer,
            cancelled: false,
        }
    }

    /// Bus without an observer; never cancels.
    pub fn silent() -> Self {
        Self::new(None)
    }

    /// Deliver an event and return the (sticky) decision.
    pub fn notify(&mut self, event: &ProgressEvent<'_>) -> Flow {
        if let Some(observer) = self.observer.as_mut() {
            if observer.on_event(event) == Flow::Cancel {
                self.cancelled = true;
            }
        }
        if self.cancelled {
            Flow::Cancel
        } else {
            Flow::Continue
        }
    }

    /// Deliver an event, turning a cancel decision into [`BackupError::Cancelled`].
    pub fn emit(&mut self, event: &ProgressEvent<'_>) -> Result<()> {
        match self.notify(event) {
            Flow::Continue => Ok(()),
            Flow::Cancel => Err(BackupError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}
