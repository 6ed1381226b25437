//! The durable progress record of a backup task
//!

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::{BackupKind, DestinationKind},
    export::Watermarks,
};

/// The outcome of uploading to one destination kind.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    /// The destination is not configured.
    pub skipped: bool,

    /// The artifact reached the destination.
    pub uploaded: bool,

    /// Why the upload failed.
    pub error: Option<String>,
}

impl UploadStatus {
    /// The status of a destination that is not configured.
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Where the local artifact of the last run is.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBackupStatus {
    /// The set folder holding the artifact.
    pub backup_directory: Option<String>,

    /// The artifact was staged in the temp folder and deleted after upload.
    pub temp_folder_used: bool,

    /// The artifact's file name.
    pub file_name: Option<String>,

    /// How long the last full backup took.
    pub last_full_duration_ms: Option<u64>,

    /// How long the last incremental backup took.
    pub last_incremental_duration_ms: Option<u64>,

    /// Why the local part of the run failed.
    pub exception: Option<String>,
}

/// A failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// The error message.
    pub message: String,

    /// When the run failed.
    pub at: DateTime<Utc>,
}

/// The progress record of one backup task, replaced at the end of every run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    /// The task's id.
    pub task_id: u64,

    /// The kind of the task's full backups.
    pub backup_kind: BackupKind,

    /// If the last run was a full backup.
    pub is_full: bool,

    /// The node that ran the last backup.
    pub node_tag: Option<String>,

    /// Every document change up to this watermark is backed up.
    pub last_document_watermark: Option<u64>,

    /// Every cluster command up to this index is backed up.
    pub last_cluster_watermark: Option<u64>,

    /// When the last full backup completed.
    pub last_full_backup: Option<DateTime<Utc>>,

    /// When the last incremental backup completed or was skipped.
    pub last_incremental_backup: Option<DateTime<Utc>>,

    /// When a full backup was last attempted.
    pub last_full_backup_attempt: Option<DateTime<Utc>>,

    /// When an incremental backup was last attempted.
    pub last_incremental_backup_attempt: Option<DateTime<Utc>>,

    /// The local artifact.
    pub local_backup: LocalBackupStatus,

    /// The upload outcome per destination kind.
    pub uploads: BTreeMap<DestinationKind, UploadStatus>,

    /// The set later incrementals are added to.
    pub folder_name: Option<String>,

    /// Incremented on every persisted update.
    pub version: u64,

    /// The last failure, cleared by a successful run.
    pub error: Option<LastError>,

    /// How long the last run took.
    pub duration_ms: Option<u64>,

    /// The id of the last run.
    pub last_operation_id: Option<u64>,
}

impl BackupStatus {
    /// The status a new run builds on, starting from the previous status.
    pub fn running_from(
        previous: Option<&Self>,
        task_id: u64,
        backup_kind: BackupKind,
        is_full: bool,
        node_tag: &str,
    ) -> Self {
        let mut status = previous.cloned().unwrap_or_default();

        status.task_id = task_id;
        status.backup_kind = backup_kind;
        status.is_full = is_full;
        status.node_tag = Some(node_tag.to_string());

        status
    }

    /// The persisted watermarks, zero if never backed up.
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            document: self.last_document_watermark.unwrap_or(0),
            cluster: self.last_cluster_watermark.unwrap_or(0),
        }
    }

    /// If a full backup completed since the task was created.
    pub fn has_full_backup(&self) -> bool {
        self.last_full_backup.is_some() && self.folder_name.is_some()
    }

    /// Record an attempt that started at `started`.
    pub fn record_attempt(&mut self, is_full: bool, started: DateTime<Utc>) {
        if is_full {
            self.last_full_backup_attempt = Some(started);
        } else {
            self.last_incremental_backup_attempt = Some(started);
        }
    }
}
