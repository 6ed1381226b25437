//! Deleting expired backup sets
//!

use core::time::Duration;
use std::{
    fs,
    io::{self, ErrorKind},
    path::PathBuf,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use shared::PathSegment;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::ValidationError,
    context::RunContext,
    naming,
    upload::{RemoteSink, SinkError, object_key},
};

const ONE_DAY: Duration = Duration::from_secs(60 * 60 * 24);

/// When completed backup sets are deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// A disabled policy never deletes anything.
    #[serde(default)]
    pub disabled: bool,

    /// Sets older than this are deleted, except the most recent set.
    pub minimum_backup_age_to_keep: Duration,
}

impl RetentionPolicy {
    /// Create an enabled policy.
    pub fn new(minimum_backup_age_to_keep: Duration) -> Self {
        Self {
            disabled: false,
            minimum_backup_age_to_keep,
        }
    }

    /// Check the minimum age is at least a day.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.minimum_backup_age_to_keep.is_zero() {
            return Err(ValidationError::RetentionNotPositive);
        }

        if self.minimum_backup_age_to_keep < ONE_DAY {
            return Err(ValidationError::RetentionTooShort(
                self.minimum_backup_age_to_keep,
            ));
        }

        Ok(())
    }
}

/// A folder tree holding one sub folder per backup set.
pub trait BackupTree {
    /// The names of the immediate child folders.
    fn list_sets(&self) -> Result<Vec<String>, RetentionError>;

    /// The names of the files in a set.
    fn list_files(&self, set: &str) -> Result<Vec<String>, RetentionError>;

    /// Delete a set. A set that fails to delete must stay discoverable.
    fn delete_set(&self, set: &str, files: &[String]) -> Result<(), RetentionError>;
}

/// Backup sets in a local folder.
#[derive(Debug, Clone)]
pub struct LocalBackupTree {
    root: PathBuf,
}

impl LocalBackupTree {
    /// A tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BackupTree for LocalBackupTree {
    fn list_sets(&self) -> Result<Vec<String>, RetentionError> {
        let directory = match fs::read_dir(&self.root) {
            Ok(directory) => directory,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(RetentionError::Io(error, "read the backup folder")),
        };

        let mut sets = Vec::new();
        for entry in directory {
            let entry = entry.map_err(|e| RetentionError::Io(e, "read a backup folder entry"))?;
            let file_type = entry
                .file_type()
                .map_err(|e| RetentionError::Io(e, "get an entry's type"))?;

            if file_type.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    sets.push(name.to_string());
                }
            }
        }

        Ok(sets)
    }

    fn list_files(&self, set: &str) -> Result<Vec<String>, RetentionError> {
        let directory = fs::read_dir(self.root.join(set))
            .map_err(|e| RetentionError::Io(e, "read a backup set"))?;

        let mut files = Vec::new();
        for entry in directory {
            let entry = entry.map_err(|e| RetentionError::Io(e, "read a backup set entry"))?;
            if let Some(name) = entry.file_name().to_str() {
                files.push(name.to_string());
            }
        }

        Ok(files)
    }

    fn delete_set(&self, set: &str, files: &[String]) -> Result<(), RetentionError> {
        let folder = self.root.join(set);

        for file in deletion_order(files) {
            match fs::remove_file(folder.join(file)) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(RetentionError::Io(error, "delete a backup file")),
            }
        }

        fs::remove_dir_all(folder).map_err(|e| RetentionError::Io(e, "delete a backup set"))
    }
}

/// Backup sets under a remote sink's folder.
pub struct RemoteBackupTree<'a> {
    sink: &'a dyn RemoteSink,
    prefix: String,
}

impl<'a> RemoteBackupTree<'a> {
    /// A tree under `prefix` of `sink`.
    pub fn new(sink: &'a dyn RemoteSink, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
        }
    }
}

impl BackupTree for RemoteBackupTree<'_> {
    fn list_sets(&self) -> Result<Vec<String>, RetentionError> {
        Ok(self.sink.list_folders(&self.prefix)?)
    }

    fn list_files(&self, set: &str) -> Result<Vec<String>, RetentionError> {
        Ok(self.sink.list_objects(&object_key(&[&self.prefix, set]))?)
    }

    fn delete_set(&self, set: &str, files: &[String]) -> Result<(), RetentionError> {
        for file in deletion_order(files) {
            self.sink
                .delete_object(&object_key(&[&self.prefix, set, file]))?;
        }

        self.sink.delete_folder(&object_key(&[&self.prefix, set]))?;

        Ok(())
    }
}

/// The files of a set with the full backup markers last, so a partially
/// deleted set is still found by the next run.
fn deletion_order(files: &[String]) -> impl Iterator<Item = &String> {
    let (markers, others): (Vec<&String>, Vec<&String>) = files
        .iter()
        .partition(|file| naming::is_full_backup_or_snapshot(file));

    others.into_iter().chain(markers)
}

/// The outcome of a retention pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    /// The sets that were deleted.
    pub deleted: Vec<String>,

    /// The sets that expired but failed to delete.
    pub failed: Vec<String>,
}

/// Deletes expired backup sets of one database.
pub struct RetentionPolicyRunner<'a> {
    policy: &'a RetentionPolicy,
    database: &'a PathSegment,
    context: &'a RunContext,
}

impl<'a> RetentionPolicyRunner<'a> {
    /// Create a runner for a database's sets.
    pub fn new(
        policy: &'a RetentionPolicy,
        database: &'a PathSegment,
        context: &'a RunContext,
    ) -> Self {
        Self {
            policy,
            database,
            context,
        }
    }

    /// Delete every expired set in `tree` except the most recent one.
    ///
    /// A set's age is measured from its oldest full backup. Folders that are
    /// not sets of this database, or hold no full backup, are left alone.
    pub fn execute(
        &self,
        tree: &dyn BackupTree,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, RetentionError> {
        let context = self.context;
        let mut report = RetentionReport::default();

        if self.policy.disabled {
            return Ok(report);
        }

        let minimum_age = TimeDelta::from_std(self.policy.minimum_backup_age_to_keep)
            .map_err(|_| RetentionError::AgeOutOfRange(self.policy.minimum_backup_age_to_keep))?;

        let mut sets: Vec<(DateTime<Utc>, String, Vec<String>)> = Vec::new();
        for set in tree.list_sets()? {
            if !naming::is_set_of(&set, self.database) {
                continue;
            }

            let files = tree.list_files(&set)?;
            let marker = files
                .iter()
                .filter(|file| naming::is_full_backup_or_snapshot(file))
                .filter_map(|file| naming::parse_timestamp(file))
                .min();

            match marker {
                Some(marker) => sets.push((marker, set, files)),
                None => debug!("{context}Set '{set}' has no full backup, ignoring"),
            }
        }

        // Oldest first, the most recent set is never a candidate.
        sets.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let Some(_most_recent) = sets.pop() else {
            return Ok(report);
        };

        for (marker, set, files) in sets {
            if now.signed_duration_since(marker) <= minimum_age {
                continue;
            }

            match tree.delete_set(&set, &files) {
                Ok(()) => {
                    info!("{context}Deleted expired backup set '{set}'");
                    report.deleted.push(set);
                }
                Err(e) => {
                    error!("{context}Could not delete expired backup set '{set}': {e}");
                    report.failed.push(set);
                }
            }
        }

        if !report.failed.is_empty() {
            warn!(
                "{context}{} expired sets will be retried on the next full backup",
                report.failed.len()
            );
        }

        Ok(report)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Remote sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Minimum backup age {0:?} is out of range")]
    AgeOutOfRange(Duration),
}
