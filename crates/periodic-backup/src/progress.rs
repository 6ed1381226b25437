//! Live progress of a backup run
//!

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{config::DestinationKind, export::ItemType, export::Watermarks};

/// Read counts of one item type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    /// Items written to the artifact.
    pub read: u64,
}

/// Progress of a storage snapshot copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotProgress {
    /// Storage files copied so far.
    pub files: u64,

    /// Bytes copied so far.
    pub bytes: u64,
}

/// The state of an upload to one destination.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Pending,
    InProgress,
    Uploaded,
    Failed(String),
}

/// Everything known about a running backup.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupProgress {
    /// Read counts per item type.
    pub items: BTreeMap<ItemType, ItemCounts>,

    /// Set for storage snapshots.
    pub snapshot: Option<SnapshotProgress>,

    /// Upload state per configured destination.
    pub uploads: BTreeMap<DestinationKind, UploadState>,

    /// The latest message.
    pub message: Option<String>,

    /// Every message, oldest first.
    pub messages: Vec<String>,
}

type ProgressCallback = Box<dyn Fn(&BackupProgress) + Send + Sync>;

/// Serialises progress updates and pushes each one to a callback.
pub struct ProgressReporter {
    progress: Mutex<BackupProgress>,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    /// A reporter that pushes every update to `callback`.
    pub fn new(callback: impl Fn(&BackupProgress) + Send + Sync + 'static) -> Self {
        Self {
            progress: Mutex::new(BackupProgress::default()),
            callback: Some(Box::new(callback)),
        }
    }

    /// A reporter nobody listens to.
    pub fn silent() -> Self {
        Self {
            progress: Mutex::new(BackupProgress::default()),
            callback: None,
        }
    }

    /// Add a message and push the update.
    pub fn add_info(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|progress| {
            progress.message = Some(message.clone());
            progress.messages.push(message);
        });
    }

    /// Count an item written to the artifact, without pushing an update.
    pub fn record_read(&self, item_type: ItemType) {
        self.modify(|progress| progress.items.entry(item_type).or_default().read += 1);
    }

    /// Count a copied snapshot file, without pushing an update.
    pub fn record_snapshot_file(&self, bytes: u64) {
        self.modify(|progress| {
            let snapshot = progress.snapshot.get_or_insert_with(SnapshotProgress::default);
            snapshot.files += 1;
            snapshot.bytes += bytes;
        });
    }

    /// Set a destination's upload state and push the update.
    pub fn set_upload(&self, destination: DestinationKind, state: UploadState) {
        self.update(|progress| {
            progress.uploads.insert(destination, state);
        });
    }

    /// A copy of the current progress.
    pub fn snapshot(&self) -> BackupProgress {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn modify(&self, change: impl FnOnce(&mut BackupProgress)) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut progress);
    }

    fn update(&self, change: impl FnOnce(&mut BackupProgress)) {
        let progress = {
            let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut progress);
            progress.clone()
        };

        // The lock is released so the callback may read the reporter.
        if let Some(callback) = &self.callback {
            callback(&progress);
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// An artifact was written.
    Completed,

    /// Nothing changed since the previous run, no artifact was written.
    Skipped,
}

/// The result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
    /// How the run ended.
    pub outcome: RunOutcome,

    /// The final progress.
    pub progress: BackupProgress,

    /// The local artifact, if one was kept.
    pub artifact: Option<PathBuf>,

    /// The watermarks the run captured.
    pub watermarks: Watermarks,

    /// The cluster index the new status was committed at, if it was.
    pub status_index: Option<u64>,
}
