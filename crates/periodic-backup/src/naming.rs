//! Names of backup sets and artifacts
//!

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use shared::PathSegment;
use thiserror::Error;

use crate::config::BackupKind;

/// The timestamp format at the start of every set and artifact name.
pub const DATE_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// The timestamp format of artifacts written by older versions.
pub const LEGACY_DATE_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Appended to an artifact until it is complete.
pub const IN_PROGRESS_EXTENSION: &str = ".in-progress";

const FULL_BACKUP_EXTENSION: &str = ".ravendb-full-backup";
const INCREMENTAL_BACKUP_EXTENSION: &str = ".ravendb-incremental-backup";
const SNAPSHOT_EXTENSION: &str = ".ravendb-snapshot";
const ENCRYPTED_FULL_BACKUP_EXTENSION: &str = ".ravendb-encrypted-full-backup";
const ENCRYPTED_INCREMENTAL_BACKUP_EXTENSION: &str = ".ravendb-encrypted-incremental-backup";
const ENCRYPTED_SNAPSHOT_EXTENSION: &str = ".ravendb-encrypted-snapshot";

const FULL_EXTENSIONS: [&str; 4] = [
    FULL_BACKUP_EXTENSION,
    SNAPSHOT_EXTENSION,
    ENCRYPTED_FULL_BACKUP_EXTENSION,
    ENCRYPTED_SNAPSHOT_EXTENSION,
];

const INCREMENTAL_EXTENSIONS: [&str; 2] = [
    INCREMENTAL_BACKUP_EXTENSION,
    ENCRYPTED_INCREMENTAL_BACKUP_EXTENSION,
];

/// Format a timestamp for a set or artifact name.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format(DATE_FORMAT).to_string()
}

/// Parse the timestamp a set or artifact name starts with.
pub fn parse_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let file_name = Path::new(name).file_name()?.to_str()?;
    let stamp = file_name.split('.').next()?;

    // Legacy names are one field shorter.
    let legacy_length = "2000-01-01-00-00".len();
    let format = if stamp.len() == legacy_length {
        LEGACY_DATE_FORMAT
    } else {
        DATE_FORMAT
    };

    let parse_input = if format == LEGACY_DATE_FORMAT {
        format!("{stamp}-00")
    } else {
        stamp.to_string()
    };

    NaiveDateTime::parse_from_str(&parse_input, DATE_FORMAT)
        .ok()
        .map(|time| time.and_utc())
}

/// The name of the folder holding a new set.
pub fn set_folder_name(
    time: DateTime<Utc>,
    database: &PathSegment,
    node_tag: &PathSegment,
    kind: BackupKind,
) -> String {
    format!(
        "{}.ravendb-{database}-{node_tag}-{}",
        format_timestamp(time),
        kind.as_str()
    )
}

/// If a folder name is a set of the given database.
///
/// The name must be exactly `<timestamp>.ravendb-<database>-<node>-<kind>`,
/// so `Orders` doesn't claim the sets of `Orders-Archive`.
pub fn is_set_of(folder_name: &str, database: &PathSegment) -> bool {
    let Some((stamp, rest)) = folder_name.split_once('.') else {
        return false;
    };
    if parse_timestamp(stamp).is_none() {
        return false;
    }

    let Some(rest) = rest.strip_prefix("ravendb-") else {
        return false;
    };
    let Some(rest) = [BackupKind::Backup, BackupKind::Snapshot]
        .iter()
        .find_map(|kind| rest.strip_suffix(kind.as_str())?.strip_suffix('-'))
    else {
        return false;
    };

    // Node tags never contain a dash, database names may.
    rest.rsplit_once('-')
        .is_some_and(|(name, node)| name == database.as_str() && !node.is_empty())
}

/// The artifact extension for a run.
pub fn backup_extension(kind: BackupKind, is_full: bool, is_encrypted: bool) -> &'static str {
    match (is_full, kind, is_encrypted) {
        (false, _, false) => INCREMENTAL_BACKUP_EXTENSION,
        (false, _, true) => ENCRYPTED_INCREMENTAL_BACKUP_EXTENSION,
        (true, BackupKind::Backup, false) => FULL_BACKUP_EXTENSION,
        (true, BackupKind::Backup, true) => ENCRYPTED_FULL_BACKUP_EXTENSION,
        (true, BackupKind::Snapshot, false) => SNAPSHOT_EXTENSION,
        (true, BackupKind::Snapshot, true) => ENCRYPTED_SNAPSHOT_EXTENSION,
    }
}

/// If a file is a full backup or a snapshot, the marker that starts a set.
pub fn is_full_backup_or_snapshot(file_name: &str) -> bool {
    FULL_EXTENSIONS
        .iter()
        .any(|extension| file_name.ends_with(extension))
}

/// If a file is a completed or in progress artifact of any kind.
pub fn is_backup_file(file_name: &str) -> bool {
    let file_name = file_name
        .strip_suffix(IN_PROGRESS_EXTENSION)
        .unwrap_or(file_name);

    is_full_backup_or_snapshot(file_name)
        || INCREMENTAL_EXTENSIONS
            .iter()
            .any(|extension| file_name.ends_with(extension))
}

/// If an artifact is encrypted, judged by its extension.
pub fn is_encrypted_artifact(file_name: &str) -> bool {
    file_name.contains(".ravendb-encrypted-")
}

/// The in progress path for an artifact.
pub fn in_progress_path(artifact_path: &Path) -> PathBuf {
    let mut path = artifact_path.as_os_str().to_os_string();
    path.push(IN_PROGRESS_EXTENSION);
    PathBuf::from(path)
}

/// Choose the artifact's file name within `directory`.
///
/// A full artifact never replaces an existing one. An incremental artifact
/// that collides gets a numbered suffix on its timestamp.
pub fn artifact_file_name(
    directory: &Path,
    time: DateTime<Utc>,
    extension: &str,
    is_full: bool,
) -> Result<(String, PathBuf), NamingError> {
    let stamp = format_timestamp(time);
    let file_name = format!("{stamp}{extension}");
    let path = directory.join(&file_name);

    if !path.exists() && !in_progress_path(&path).exists() {
        return Ok((file_name, path));
    }

    if is_full {
        return Err(NamingError::ArtifactExists(path));
    }

    for attempt in 1..=u16::MAX {
        let file_name = format!("{stamp}-{attempt}{extension}");
        let path = directory.join(&file_name);

        if !path.exists() && !in_progress_path(&path).exists() {
            return Ok((file_name, path));
        }
    }

    Err(NamingError::ArtifactExists(path))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum NamingError {
    #[error("File '{0:?}' already exists")]
    ArtifactExists(PathBuf),
}
