//! Context for the current backup run
//!

use core::fmt;

/// Context for the current backup run, prefixed to its log lines.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The database being backed up.
    pub database: String,

    /// The backup task's name.
    pub task_name: String,

    /// If the run is a full backup.
    pub is_full: bool,
}

impl RunContext {
    /// Create the context for a run.
    pub fn new(database: impl Into<String>, task_name: impl Into<String>, is_full: bool) -> Self {
        Self {
            database: database.into(),
            task_name: task_name.into(),
            is_full,
        }
    }
}

impl fmt::Display for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_full { "full" } else { "incremental" };
        write!(f, "[{}/{}/{kind}] ", self.database, self.task_name)
    }
}
