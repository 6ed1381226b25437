//! The consensus layer as the backup task sees it
//!

use core::time::Duration;
use std::sync::{Condvar, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::status::BackupStatus;

/// A command replicated through the cluster's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClusterCommand {
    /// Replace a backup task's status record.
    UpdateBackupStatus {
        /// The database the task belongs to.
        database: String,

        /// Makes resubmitting the command idempotent.
        request_id: Uuid,

        /// The new status.
        status: BackupStatus,
    },
}

impl ClusterCommand {
    /// A status update with a fresh request id.
    pub fn update_backup_status(database: impl Into<String>, status: BackupStatus) -> Self {
        Self::UpdateBackupStatus {
            database: database.into(),
            request_id: Uuid::new_v4(),
            status,
        }
    }

    /// The command's request id.
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::UpdateBackupStatus { request_id, .. } => *request_id,
        }
    }
}

/// Submits commands to the cluster and reads replicated state.
pub trait ClusterClient: Send + Sync {
    /// This node's tag.
    fn node_tag(&self) -> String;

    /// Submit a command to the leader, returning the log index it was assigned.
    fn send_to_leader(&self, command: ClusterCommand) -> Result<u64, ClusterError>;

    /// Block until this node has committed `index`, or the timeout passes.
    fn wait_for_commit(&self, index: u64, timeout: Duration) -> Result<(), ClusterError>;

    /// The committed status of a backup task.
    fn backup_status(&self, database: &str, task_id: u64)
    -> Result<Option<BackupStatus>, ClusterError>;
}

/// The highest committed log index, which threads can wait on.
#[derive(Debug, Default)]
pub struct CommitIndexWatch {
    committed: Mutex<u64>,
    changed: Condvar,
}

impl CommitIndexWatch {
    /// A watch at index zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest committed index.
    pub fn committed(&self) -> u64 {
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `index` was committed and wake the waiters. Never moves back.
    pub fn advance(&self, index: u64) {
        let mut committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        if index > *committed {
            *committed = index;
            self.changed.notify_all();
        }
    }

    /// Block until `index` is committed.
    pub fn wait_at_least(&self, index: u64, timeout: Duration) -> Result<(), ClusterError> {
        let committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        let (committed, _) = self
            .changed
            .wait_timeout_while(committed, timeout, |committed| *committed < index)
            .unwrap_or_else(PoisonError::into_inner);

        if *committed >= index {
            Ok(())
        } else {
            Err(ClusterError::CommitTimeout(index, timeout))
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("The cluster is unavailable: {0}")]
    Unavailable(String),

    #[error("The leader rejected the command: {0}")]
    Rejected(String),

    #[error("Index {0} was not committed within {1:?}")]
    CommitTimeout(u64, Duration),
}
