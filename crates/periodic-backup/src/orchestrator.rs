//! One backup run from start to finish
//!

use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use shared::{CancellationToken, Cancelled, CheckCancelled, Clock, PathSegment};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    alert::{Alert, AlertSink},
    cluster::ClusterClient,
    config::{BackupDefinition, BackupKind, Config, ValidationError},
    context::RunContext,
    encryption::{DurableWrite, EncryptionError, EncryptionKey, EncryptionSelector, OutputStream},
    export::{
        ArtifactHeader, ArtifactWriter, DocumentDatabase, ExportError, ExportOptions,
        ExportSource, ItemType, SnapshotFile, Watermarks,
    },
    naming::{self, NamingError},
    persistence::StatusPersistence,
    progress::{BackupResult, ProgressReporter, RunOutcome},
    retention::{LocalBackupTree, RetentionPolicyRunner},
    settings::{self, SettingsError},
    status::{BackupStatus, LastError},
    upload::{RemoteRetention, SinkConnector, UploadError, UploadPipeline, UploadTarget},
};

/// Where the artifact of a run is written.
struct Placement {
    folder_name: String,
    directory: PathBuf,
    temp_folder_used: bool,
}

/// Runs backups of one database.
///
/// The orchestrator assumes no two runs of the same definition overlap,
/// the scheduler enforces that.
pub struct BackupOrchestrator {
    database: Arc<dyn DocumentDatabase>,
    cluster: Arc<dyn ClusterClient>,
    connector: Arc<dyn SinkConnector>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    shutdown: CancellationToken,
    temp_path: PathBuf,
    commit_timeout: Duration,
    next_operation_id: AtomicU64,
}

impl BackupOrchestrator {
    /// Create an orchestrator. Cancelling `shutdown` stops every run without
    /// saving its status. Failed runs are raised on `alerts`.
    pub fn new(
        database: Arc<dyn DocumentDatabase>,
        cluster: Arc<dyn ClusterClient>,
        connector: Arc<dyn SinkConnector>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
        shutdown: CancellationToken,
        config: &Config,
    ) -> Self {
        Self {
            database,
            cluster,
            connector,
            clock,
            alerts,
            shutdown,
            temp_path: config.temp_path.clone(),
            commit_timeout: config.status_commit_timeout(),
            next_operation_id: AtomicU64::new(1),
        }
    }

    /// The database being backed up.
    pub fn database(&self) -> &dyn DocumentDatabase {
        self.database.as_ref()
    }

    /// The cluster status is read from and written to.
    pub fn cluster(&self) -> &dyn ClusterClient {
        self.cluster.as_ref()
    }

    /// A token to abort a single run, also cancelled on shutdown.
    pub fn abort_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Run one backup.
    ///
    /// `previous` is the last committed status of the definition. `abort`
    /// must come from [`Self::abort_token`]. The new status is saved whatever
    /// the outcome unless the database is shutting down, but the watermarks
    /// only advance when the run succeeds.
    pub fn run(
        &self,
        definition: &BackupDefinition,
        previous: Option<&BackupStatus>,
        is_full: bool,
        abort: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<BackupResult, BackupRunError> {
        let started = self.clock.now();
        let timer = Instant::now();
        let database_name = self.database.name().to_string();

        let (definition, settings_error) =
            match settings::resolve_definition(definition, &database_name) {
                Ok(resolved) => (resolved, None),
                Err(e) => (definition.clone(), Some(e)),
            };
        let definition = &definition;

        let is_full = is_full || self.needs_full_backup(definition, previous);
        let context = RunContext::new(&database_name, &definition.name, is_full);
        let node_tag = self.cluster.node_tag();

        let mut status = BackupStatus::running_from(
            previous,
            definition.task_id,
            definition.kind,
            is_full,
            &node_tag,
        );
        status.last_operation_id = Some(self.next_operation_id.fetch_add(1, Ordering::Relaxed));

        info!("{context}Starting backup task '{}'", definition.name);

        let outcome = match settings_error {
            Some(e) => Err(BackupRunError::Settings(e)),
            None => self.execute(
                &context,
                definition,
                previous,
                is_full,
                &node_tag,
                started,
                &mut status,
                abort,
                progress,
            ),
        };

        let elapsed = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            Ok(result) if result.outcome == RunOutcome::Skipped => {
                info!("{context}Nothing changed since the last backup, skipped");
            }
            Ok(_) => info!("{context}Backup completed in {elapsed}ms"),
            Err(BackupRunError::Cancelled) => warn!("{context}Backup was cancelled"),
            Err(e) => {
                error!("{context}Backup failed: {e}");
                self.alerts.raise(Alert {
                    database: database_name.clone(),
                    task_id: definition.task_id,
                    task_name: definition.name.clone(),
                    message: e.to_string(),
                    at: self.clock.now(),
                });
            }
        }

        if matches!(outcome, Err(BackupRunError::Cancelled)) && self.shutdown.is_cancelled() {
            return outcome;
        }

        status.record_attempt(is_full, started);
        status.duration_ms = Some(elapsed);
        status.version = previous.map_or(0, |previous| previous.version) + 1;
        status.error = match &outcome {
            Ok(_) | Err(BackupRunError::Cancelled) => None,
            Err(e) => Some(LastError {
                message: e.to_string(),
                at: self.clock.now(),
            }),
        };

        let persistence =
            StatusPersistence::new(self.cluster.as_ref(), self.commit_timeout, &self.shutdown);
        let index = persistence.persist_best_effort(&context, &database_name, &status);

        outcome.map(|mut result| {
            result.status_index = index;
            result.progress = progress.snapshot();
            result
        })
    }

    fn needs_full_backup(
        &self,
        definition: &BackupDefinition,
        previous: Option<&BackupStatus>,
    ) -> bool {
        let Some(folder_name) = previous.and_then(|previous| previous.folder_name.as_ref()) else {
            return true;
        };

        // An incremental needs its set on disk to be added to.
        match &definition.local {
            Some(local) => !local.folder_path.join(folder_name).is_dir(),
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        context: &RunContext,
        definition: &BackupDefinition,
        previous: Option<&BackupStatus>,
        is_full: bool,
        node_tag: &str,
        now: DateTime<Utc>,
        status: &mut BackupStatus,
        abort: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<BackupResult, BackupRunError> {
        let master_key = self.database.master_key();
        definition.validate(master_key.is_some(), is_full)?;

        let database = self
            .database
            .name_segment()
            .map_err(|_| BackupRunError::InvalidName(self.database.name().to_string()))?;
        let node = PathSegment::try_from(node_tag)
            .map_err(|_| BackupRunError::InvalidName(node_tag.to_string()))?;

        abort.check()?;

        let previous_watermarks = previous
            .filter(|previous| previous.last_document_watermark.is_some())
            .map(BackupStatus::watermarks);
        let current = Watermarks {
            document: self.database.last_document_watermark(),
            cluster: self.database.last_cluster_watermark(),
        };

        if !is_full && previous_watermarks == Some(current) {
            status.last_incremental_backup = Some(now);
            progress.add_info("Nothing changed since the last backup, skipping");

            return Ok(BackupResult {
                outcome: RunOutcome::Skipped,
                progress: progress.snapshot(),
                artifact: None,
                watermarks: current,
                status_index: None,
            });
        }

        let placement = self.placement(definition, previous, is_full, &database, &node, now)?;
        fs::create_dir_all(&placement.directory)
            .map_err(|e| BackupRunError::Io(e, "create the backup folder"))?;

        let key = EncryptionSelector::select(master_key.as_ref(), definition.encryption.as_ref())
            .map_err(ValidationError::from)?;
        let extension = naming::backup_extension(definition.kind, is_full, key.is_some());
        let (file_name, artifact) =
            naming::artifact_file_name(&placement.directory, now, extension, is_full)?;

        status.local_backup.backup_directory = Some(placement.directory.display().to_string());
        status.local_backup.temp_folder_used = placement.temp_folder_used;
        status.local_backup.file_name = Some(file_name.clone());
        status.local_backup.exception = None;

        progress.add_info(format!("Writing {file_name}"));

        let in_progress = naming::in_progress_path(&artifact);
        let written = self.write_artifact(
            definition,
            previous_watermarks,
            is_full,
            key.as_ref(),
            &in_progress,
            now,
            current,
            progress,
            abort,
        );

        let achieved = match written.and_then(|achieved| {
            abort.check()?;
            fs::rename(&in_progress, &artifact)
                .map_err(|e| BackupRunError::Io(e, "rename the in progress file"))?;
            Ok(achieved)
        }) {
            Ok(achieved) => achieved,
            Err(e) => {
                let _ = fs::remove_file(&in_progress);
                if placement.temp_folder_used {
                    let _ = fs::remove_dir(&placement.directory);
                }
                if !matches!(e, BackupRunError::Cancelled) {
                    status.local_backup.exception = Some(e.to_string());
                }
                return Err(e);
            }
        };

        // Never behind what an earlier backup already captured.
        let achieved = match previous_watermarks {
            Some(previous) => achieved.max(previous),
            None => achieved,
        };

        progress.add_info(format!("Backup written to {}", artifact.display()));

        let retention = definition.active_retention().filter(|_| is_full);

        if let (Some(policy), Some(local)) = (retention, &definition.local) {
            let runner = RetentionPolicyRunner::new(policy, &database, context);
            match runner.execute(&LocalBackupTree::new(&local.folder_path), now) {
                Ok(report) if !report.deleted.is_empty() => {
                    progress.add_info(format!("Deleted {} expired sets", report.deleted.len()));
                }
                Ok(_) => {}
                Err(e) => warn!("{context}Local retention failed: {e}"),
            }
        }

        let pipeline = UploadPipeline::new(self.connector.as_ref(), context);
        let summary = pipeline.upload(
            UploadTarget {
                artifact: &artifact,
                folder_name: &placement.folder_name,
                file_name: &file_name,
            },
            &definition.destinations,
            retention.map(|policy| RemoteRetention {
                policy,
                database: &database,
                now,
            }),
            progress,
            abort,
        );
        status.uploads = summary.statuses.clone();

        if placement.temp_folder_used {
            if let Err(e) = fs::remove_file(&artifact) {
                warn!("{context}Could not delete the staged artifact {artifact:?}: {e}");
            }
            let _ = fs::remove_dir(&placement.directory);
        }

        if summary.cancelled {
            return Err(BackupRunError::Cancelled);
        }
        if let Some(e) = summary.error() {
            return Err(BackupRunError::Upload(e));
        }

        let duration = u64::try_from(
            self.clock
                .now()
                .signed_duration_since(now)
                .num_milliseconds()
                .max(0),
        )
        .unwrap_or(0);

        status.is_full = is_full;
        status.last_document_watermark = Some(achieved.document);
        status.last_cluster_watermark = Some(achieved.cluster);
        if is_full {
            status.last_full_backup = Some(now);
            status.folder_name = Some(placement.folder_name.clone());
            status.local_backup.last_full_duration_ms = Some(duration);
        } else {
            status.last_incremental_backup = Some(now);
            status.local_backup.last_incremental_duration_ms = Some(duration);
        }

        Ok(BackupResult {
            outcome: RunOutcome::Completed,
            progress: progress.snapshot(),
            artifact: (!placement.temp_folder_used).then_some(artifact),
            watermarks: achieved,
            status_index: None,
        })
    }

    fn placement(
        &self,
        definition: &BackupDefinition,
        previous: Option<&BackupStatus>,
        is_full: bool,
        database: &PathSegment,
        node: &PathSegment,
        now: DateTime<Utc>,
    ) -> Result<Placement, BackupRunError> {
        let folder_name = if is_full {
            naming::set_folder_name(now, database, node, definition.kind)
        } else {
            previous
                .and_then(|previous| previous.folder_name.clone())
                .ok_or(BackupRunError::NoFullBackup)?
        };

        let (directory, temp_folder_used) = match &definition.local {
            Some(local) => (local.folder_path.join(&folder_name), false),
            None => (self.temp_path.join(&folder_name), true),
        };

        Ok(Placement {
            folder_name,
            directory,
            temp_folder_used,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_artifact(
        &self,
        definition: &BackupDefinition,
        previous_watermarks: Option<Watermarks>,
        is_full: bool,
        key: Option<&EncryptionKey>,
        in_progress: &Path,
        now: DateTime<Utc>,
        current: Watermarks,
        progress: &ProgressReporter,
        abort: &CancellationToken,
    ) -> Result<Watermarks, BackupRunError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(in_progress)
            .map_err(|e| BackupRunError::Io(e, "create the in progress file"))?;
        let mut output: OutputStream<BufWriter<File>> = OutputStream::new(BufWriter::new(file), key)?;

        let achieved = if is_full && definition.kind == BackupKind::Snapshot {
            // Everything up to the current watermarks is in the copied files.
            let mut files = 0u64;
            self.database.copy_storage_to(
                &mut output,
                &mut |file: &SnapshotFile| {
                    files += 1;
                    progress.record_snapshot_file(file.bytes);
                },
                abort,
            )?;
            progress.add_info(format!("Copied {files} storage files"));

            current
        } else {
            let start = match previous_watermarks {
                Some(previous) if !is_full => previous.next(),
                _ => Watermarks::default(),
            };

            let source = ExportSource::new(self.database.as_ref());
            let mut session = source.open(
                start,
                ExportOptions {
                    include_tombstones: !is_full,
                },
                abort,
            )?;
            let achieved = session.watermarks();

            let header = ArtifactHeader {
                database: self.database.name().to_string(),
                is_full,
                created_at: now,
                start,
            };
            let mut writer = ArtifactWriter::new(&mut output, &header)?;

            loop {
                let item_type = session.next_item_type();
                if item_type == ItemType::End {
                    break;
                }

                let mut read = 0u64;
                for item in session.items(item_type)? {
                    abort.check()?;
                    writer.write_item(&item)?;
                    progress.record_read(item_type);
                    read += 1;
                }

                progress.add_info(format!("Backed up {read} items of type {item_type:?}"));
            }

            writer.finish(achieved)?;
            achieved
        };

        abort.check()?;

        let mut raw = output.finish()?;
        raw.sync_to_disk()
            .map_err(|e| BackupRunError::Io(e, "sync the artifact"))?;

        Ok(achieved)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BackupRunError {
    #[error("Invalid backup configuration: {0}")]
    Configuration(#[from] ValidationError),

    #[error("'{0}' can't be used in a file name")]
    InvalidName(String),

    #[error("Can't overwrite an existing backup: {0}")]
    ArtifactExists(#[from] NamingError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("An incremental backup needs a full backup to add to")]
    NoFullBackup,

    #[error("Failed to export the database: {0}")]
    Export(#[source] ExportError),

    #[error("Failed to encrypt the backup: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("The backup was cancelled")]
    Cancelled,
}

impl BackupRunError {
    /// If the run failed because of its configuration, retrying won't help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidName(_) | Self::ArtifactExists(_)
        )
    }

    /// If the run was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ExportError> for BackupRunError {
    fn from(value: ExportError) -> Self {
        match value {
            ExportError::Cancelled => Self::Cancelled,
            other => Self::Export(other),
        }
    }
}

impl From<Cancelled> for BackupRunError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
