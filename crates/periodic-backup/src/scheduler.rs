//! Deciding when backups run and keeping runs of a task from overlapping
//!

use core::time::Duration;
use std::{
    collections::HashSet,
    io,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use shared::{CancellationToken, Clock};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    cluster::ClusterError,
    config::BackupDefinition,
    orchestrator::{BackupOrchestrator, BackupRunError},
    progress::{BackupProgress, BackupResult, ProgressReporter},
    status::BackupStatus,
};

/// The kind of backup a task is due for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    #[allow(missing_docs)]
    Full,
    #[allow(missing_docs)]
    Incremental,
}

impl RunKind {
    /// If the run is a full backup.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Marks a task as running until dropped.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<Mutex<HashSet<u64>>>,
    task_id: u64,
}

impl RunGuard {
    /// The guarded task.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

/// A run started by the scheduler.
pub struct RunHandle {
    task_id: u64,
    abort: CancellationToken,
    progress: Arc<ProgressReporter>,
    thread: JoinHandle<Result<BackupResult, BackupRunError>>,
}

impl RunHandle {
    /// The task being backed up.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Ask the run to stop. Its attempt is still recorded.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// The current progress.
    pub fn progress(&self) -> BackupProgress {
        self.progress.snapshot()
    }

    /// Wait for the run to end.
    pub fn join(self) -> Result<BackupResult, ScheduleError> {
        match self.thread.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(ScheduleError::Panicked(self.task_id)),
        }
    }
}

/// Starts backup runs, at most one per task at a time.
pub struct BackupScheduler {
    orchestrator: Arc<BackupOrchestrator>,
    clock: Arc<dyn Clock>,
    running: Arc<Mutex<HashSet<u64>>>,
}

impl BackupScheduler {
    /// A scheduler for one database's tasks.
    pub fn new(orchestrator: Arc<BackupOrchestrator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            orchestrator,
            clock,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Mark a task as running, `None` if it already is.
    pub fn try_begin(&self, task_id: u64) -> Option<RunGuard> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(task_id) {
            return None;
        }

        Some(RunGuard {
            running: Arc::clone(&self.running),
            task_id,
        })
    }

    /// If a task has a run in progress.
    pub fn is_running(&self, task_id: u64) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&task_id)
    }

    /// The kind of backup a task is due for at `now`, if any.
    ///
    /// A task without a completed full backup is only ever due for a full
    /// backup. Failed attempts count as runs so a failing task isn't retried
    /// before its cadence passes again.
    pub fn due_run(
        definition: &BackupDefinition,
        status: Option<&BackupStatus>,
        now: DateTime<Utc>,
    ) -> Option<RunKind> {
        if definition.disabled {
            return None;
        }

        let elapsed = |times: &[Option<DateTime<Utc>>]| -> Option<Duration> {
            times
                .iter()
                .flatten()
                .max()
                .map(|last| now.signed_duration_since(*last).to_std().unwrap_or(Duration::ZERO))
        };

        let Some(status) = status.filter(|status| status.has_full_backup()) else {
            let cadence = definition
                .full_backup_cadence
                .or(definition.incremental_backup_cadence)?;
            let last_attempt = status.and_then(|status| status.last_full_backup_attempt);

            return match elapsed(&[last_attempt]) {
                Some(elapsed) if !cadence.is_due(elapsed) => None,
                _ => Some(RunKind::Full),
            };
        };

        if let Some(cadence) = definition.full_backup_cadence {
            let since = elapsed(&[status.last_full_backup, status.last_full_backup_attempt]);
            if since.is_none_or(|since| cadence.is_due(since)) {
                return Some(RunKind::Full);
            }
        }

        if let Some(cadence) = definition.incremental_backup_cadence {
            let since = elapsed(&[
                status.last_full_backup,
                status.last_incremental_backup,
                status.last_incremental_backup_attempt,
            ]);
            if since.is_none_or(|since| cadence.is_due(since)) {
                return Some(RunKind::Incremental);
            }
        }

        None
    }

    /// Start a run of `definition` on its own thread.
    pub fn start(
        &self,
        definition: BackupDefinition,
        is_full: bool,
        progress: ProgressReporter,
    ) -> Result<RunHandle, ScheduleError> {
        let guard = self
            .try_begin(definition.task_id)
            .ok_or(ScheduleError::AlreadyRunning(definition.task_id))?;

        let previous = self
            .orchestrator
            .cluster()
            .backup_status(self.orchestrator.database().name(), definition.task_id)?;

        self.spawn(guard, definition, previous, is_full, progress)
    }

    /// Start every task that is due.
    pub fn run_due(&self, definitions: &[BackupDefinition]) -> Vec<RunHandle> {
        let now = self.clock.now();
        let database = self.orchestrator.database().name().to_string();
        let mut handles = Vec::new();

        for definition in definitions {
            let Some(guard) = self.try_begin(definition.task_id) else {
                debug!("Task '{}' is still running", definition.name);
                continue;
            };

            let previous = match self
                .orchestrator
                .cluster()
                .backup_status(&database, definition.task_id)
            {
                Ok(previous) => previous,
                Err(e) => {
                    error!("Could not read the status of task '{}': {e}", definition.name);
                    continue;
                }
            };

            let Some(kind) = Self::due_run(definition, previous.as_ref(), now) else {
                continue;
            };

            info!("Task '{}' is due for a {kind:?} backup", definition.name);

            match self.spawn(
                guard,
                definition.clone(),
                previous,
                kind.is_full(),
                ProgressReporter::silent(),
            ) {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Could not start task '{}': {e}", definition.name),
            }
        }

        handles
    }

    fn spawn(
        &self,
        guard: RunGuard,
        definition: BackupDefinition,
        previous: Option<BackupStatus>,
        is_full: bool,
        progress: ProgressReporter,
    ) -> Result<RunHandle, ScheduleError> {
        let task_id = definition.task_id;
        let abort = self.orchestrator.abort_token();
        let progress = Arc::new(progress);

        let orchestrator = Arc::clone(&self.orchestrator);
        let thread_abort = abort.clone();
        let thread_progress = Arc::clone(&progress);

        let thread = thread::Builder::new()
            .name(format!("backup-{task_id}"))
            .spawn(move || {
                let _guard = guard;
                orchestrator.run(
                    &definition,
                    previous.as_ref(),
                    is_full,
                    &thread_abort,
                    &thread_progress,
                )
            })
            .map_err(ScheduleError::Spawn)?;

        Ok(RunHandle {
            task_id,
            abort,
            progress,
            thread,
        })
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Task {0} is already running")]
    AlreadyRunning(u64),

    #[error("Failed to read the previous status: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Failed to spawn the backup thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Run(#[from] BackupRunError),

    #[error("The run of task {0} panicked")]
    Panicked(u64),
}
