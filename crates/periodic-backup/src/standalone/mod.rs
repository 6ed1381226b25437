//! # standalone
//! A single node host for the backup runner.
//!
//! The database is an append only journal of document changes and the
//! cluster is a status file that commits every command immediately.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

mod file_cluster;
mod journal;

pub use file_cluster::FileCluster;
pub use journal::{JournalDatabase, JournalEntry};

/// The node and database the runner backs up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandaloneConfig {
    /// This node's tag.
    pub node_tag: String,

    /// The database name.
    pub database: String,

    /// The database's change journal.
    pub journal_path: PathBuf,

    /// Where backup statuses are kept.
    pub status_path: PathBuf,

    /// How often due tasks are checked.
    pub poll_interval_seconds: u64,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            node_tag: "A".to_string(),
            database: "Default".to_string(),
            journal_path: PathBuf::from("./journal.jsonl"),
            status_path: PathBuf::from("./backup-status.json"),
            poll_interval_seconds: 60,
        }
    }
}
