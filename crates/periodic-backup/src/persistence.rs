//! Committing backup status through the cluster
//!

use core::time::Duration;

use shared::{CancellationToken, CheckCancelled};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    cluster::{ClusterClient, ClusterCommand, ClusterError},
    context::RunContext,
    status::BackupStatus,
};

/// Replicates status records so any node can resume a task.
pub struct StatusPersistence<'a> {
    cluster: &'a dyn ClusterClient,
    timeout: Duration,
    shutdown: &'a CancellationToken,
}

impl<'a> StatusPersistence<'a> {
    /// Persist through `cluster`, waiting at most `timeout` for the commit.
    pub fn new(
        cluster: &'a dyn ClusterClient,
        timeout: Duration,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            cluster,
            timeout,
            shutdown,
        }
    }

    /// Submit the status to the leader and wait for it to commit.
    pub fn persist(&self, database: &str, status: &BackupStatus) -> Result<u64, StatusError> {
        self.shutdown.check().map_err(|_| StatusError::Cancelled)?;

        let command = ClusterCommand::update_backup_status(database, status.clone());
        let request_id = command.request_id();
        let index = self.cluster.send_to_leader(command)?;

        debug!("Status update {request_id} for task {} got index {index}", status.task_id);

        self.shutdown.check().map_err(|_| StatusError::Cancelled)?;
        self.cluster.wait_for_commit(index, self.timeout)?;

        Ok(index)
    }

    /// Persist the status, logging and swallowing any failure.
    pub fn persist_best_effort(
        &self,
        context: &RunContext,
        database: &str,
        status: &BackupStatus,
    ) -> Option<u64> {
        match self.persist(database, status) {
            Ok(index) => Some(index),
            Err(StatusError::Cancelled) => {
                warn!("{context}Shutting down, the backup status was not saved");
                None
            }
            Err(e) => {
                error!("{context}Failed to save the backup status: {e}");
                None
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Failed to replicate the status: {0}")]
    Cluster(#[from] ClusterError),

    #[error("The database is shutting down")]
    Cancelled,
}
