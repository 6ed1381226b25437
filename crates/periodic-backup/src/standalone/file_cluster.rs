//! A single node cluster that keeps statuses in a file
//!

use core::time::Duration;
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    cluster::{ClusterClient, ClusterCommand, ClusterError, CommitIndexWatch},
    status::BackupStatus,
};

/// The persisted state of the cluster.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StatusFile {
    last_index: u64,
    statuses: BTreeMap<String, BackupStatus>,
}

/// Commits every command as soon as it is written to the status file.
#[derive(Debug)]
pub struct FileCluster {
    node_tag: String,
    path: PathBuf,
    state: Mutex<StatusFile>,
    commits: CommitIndexWatch,
}

impl FileCluster {
    /// Open the status file at `path`, starting empty if there is none.
    pub fn open(node_tag: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ClusterError> {
        let path = path.into();

        let state = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                ClusterError::Unavailable(format!("The status file {path:?} is invalid: {e}"))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => StatusFile::default(),
            Err(e) => {
                return Err(ClusterError::Unavailable(format!(
                    "Failed to read the status file {path:?}: {e}"
                )));
            }
        };

        let commits = CommitIndexWatch::new();
        commits.advance(state.last_index);

        Ok(Self {
            node_tag: node_tag.into(),
            path,
            state: Mutex::new(state),
            commits,
        })
    }

    fn key(database: &str, task_id: u64) -> String {
        format!("{database}/{task_id}")
    }
}

fn save(path: &Path, state: &StatusFile) -> Result<(), ClusterError> {
    let contents = serde_json::to_string_pretty(state)
        .map_err(|e| ClusterError::Rejected(format!("Failed to serialize the statuses: {e}")))?;

    let staged = path.with_extension("tmp");
    fs::write(&staged, contents)
        .and_then(|()| fs::rename(&staged, path))
        .map_err(|e| ClusterError::Unavailable(format!("Failed to write {path:?}: {e}")))
}

impl ClusterClient for FileCluster {
    fn node_tag(&self) -> String {
        self.node_tag.clone()
    }

    fn send_to_leader(&self, command: ClusterCommand) -> Result<u64, ClusterError> {
        let ClusterCommand::UpdateBackupStatus {
            database, status, ..
        } = command;

        let index = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            let mut updated = state.clone();
            updated.last_index += 1;
            updated
                .statuses
                .insert(Self::key(&database, status.task_id), status);

            save(&self.path, &updated)?;
            *state = updated;
            state.last_index
        };

        self.commits.advance(index);

        Ok(index)
    }

    fn wait_for_commit(&self, index: u64, timeout: Duration) -> Result<(), ClusterError> {
        self.commits.wait_at_least(index, timeout)
    }

    fn backup_status(
        &self,
        database: &str,
        task_id: u64,
    ) -> Result<Option<BackupStatus>, ClusterError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.statuses.get(&Self::key(database, task_id)).cloned())
    }
}
