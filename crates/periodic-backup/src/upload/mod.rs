//! Copying finished artifacts to their destinations
//!

use core::fmt::Write as _;
use std::{collections::BTreeMap, io, path::Path, thread};

use chrono::{DateTime, Utc};
use shared::{CancellationToken, PathSegment};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    config::{Destination, DestinationKind},
    context::RunContext,
    progress::{ProgressReporter, UploadState},
    retention::{RemoteBackupTree, RetentionPolicy, RetentionPolicyRunner},
    status::UploadStatus,
};

mod local_folder;

pub use local_folder::LocalFolderSink;

/// Join key parts with `/`, skipping empty parts.
pub fn object_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// A destination that artifacts are uploaded to.
///
/// Keys are `/` separated. Sinks that can't list or delete keep the
/// defaults and are skipped by retention.
pub trait RemoteSink: Send + Sync {
    /// The destination kind.
    fn kind(&self) -> DestinationKind;

    /// Upload the file at `source` to `key`.
    fn upload(&self, key: &str, source: &Path, cancel: &CancellationToken)
    -> Result<(), SinkError>;

    /// If the sink supports listing and deleting.
    fn supports_listing(&self) -> bool {
        false
    }

    /// The names of the folders directly under `prefix`.
    fn list_folders(&self, _prefix: &str) -> Result<Vec<String>, SinkError> {
        Err(SinkError::Unsupported(self.kind(), "list folders"))
    }

    /// The names of the objects directly under `prefix`.
    fn list_objects(&self, _prefix: &str) -> Result<Vec<String>, SinkError> {
        Err(SinkError::Unsupported(self.kind(), "list objects"))
    }

    /// Delete the object at `key`.
    fn delete_object(&self, _key: &str) -> Result<(), SinkError> {
        Err(SinkError::Unsupported(self.kind(), "delete objects"))
    }

    /// Remove an empty folder. Object stores have no folders to remove.
    fn delete_folder(&self, _prefix: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Opens a sink for a configured destination.
pub trait SinkConnector: Send + Sync {
    /// Open the sink.
    fn connect(&self, destination: &Destination) -> Result<Box<dyn RemoteSink>, SinkError>;
}

/// Connects local folder destinations. Other providers need their own connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFolderConnector;

impl SinkConnector for LocalFolderConnector {
    fn connect(&self, destination: &Destination) -> Result<Box<dyn RemoteSink>, SinkError> {
        match destination {
            Destination::LocalFolder(settings) => {
                Ok(Box::new(LocalFolderSink::new(&settings.folder_path)))
            }
            other => Err(SinkError::NoConnector(other.kind())),
        }
    }
}

/// The artifact to upload.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    /// The finished local artifact.
    pub artifact: &'a Path,

    /// The set the artifact belongs to.
    pub folder_name: &'a str,

    /// The artifact's file name.
    pub file_name: &'a str,
}

/// Retention to apply to each sink after a full backup is uploaded.
#[derive(Debug, Clone, Copy)]
pub struct RemoteRetention<'a> {
    /// The policy.
    pub policy: &'a RetentionPolicy,

    /// The database whose sets are pruned.
    pub database: &'a PathSegment,

    /// The time ages are measured from.
    pub now: DateTime<Utc>,
}

/// The outcome of uploading to every destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// The status of every destination kind, configured or not.
    pub statuses: BTreeMap<DestinationKind, UploadStatus>,

    /// If cancellation stopped an upload.
    pub cancelled: bool,
}

impl UploadSummary {
    fn new() -> Self {
        let statuses = DestinationKind::ALL
            .into_iter()
            .map(|kind| (kind, UploadStatus::skipped()))
            .collect();

        Self {
            statuses,
            cancelled: false,
        }
    }

    /// The error to fail the run with, if any destination failed.
    pub fn error(&self) -> Option<UploadError> {
        let failures: Vec<(DestinationKind, String)> = self
            .statuses
            .iter()
            .filter_map(|(kind, status)| status.error.clone().map(|error| (*kind, error)))
            .collect();

        if failures.is_empty() {
            None
        } else {
            Some(UploadError { failures })
        }
    }
}

enum DestinationOutcome {
    Uploaded,
    Failed(String),
    Cancelled,
}

/// Uploads an artifact to every configured destination.
pub struct UploadPipeline<'a> {
    connector: &'a dyn SinkConnector,
    context: &'a RunContext,
}

impl<'a> UploadPipeline<'a> {
    /// Create a pipeline that opens sinks with `connector`.
    pub fn new(connector: &'a dyn SinkConnector, context: &'a RunContext) -> Self {
        Self { connector, context }
    }

    /// Upload to every destination concurrently.
    ///
    /// A failed destination doesn't stop the others. Destinations that are
    /// not configured are reported as skipped.
    pub fn upload(
        &self,
        target: UploadTarget<'_>,
        destinations: &[Destination],
        retention: Option<RemoteRetention<'_>>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> UploadSummary {
        let mut summary = UploadSummary::new();

        for destination in destinations {
            progress.set_upload(destination.kind(), UploadState::Pending);
        }

        let outcomes: Vec<(DestinationKind, DestinationOutcome)> = thread::scope(|scope| {
            let handles: Vec<_> = destinations
                .iter()
                .map(|destination| {
                    let handle = scope.spawn(move || {
                        self.upload_one(destination, target, retention, progress, cancel)
                    });
                    (destination.kind(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(kind, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        DestinationOutcome::Failed("the upload thread panicked".to_string())
                    });
                    (kind, outcome)
                })
                .collect()
        });

        for (kind, outcome) in outcomes {
            let status = summary.statuses.entry(kind).or_default();
            status.skipped = false;

            match outcome {
                DestinationOutcome::Uploaded => status.uploaded = true,
                DestinationOutcome::Failed(error) => status.error = Some(error),
                DestinationOutcome::Cancelled => summary.cancelled = true,
            }
        }

        summary
    }

    fn upload_one(
        &self,
        destination: &Destination,
        target: UploadTarget<'_>,
        retention: Option<RemoteRetention<'_>>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> DestinationOutcome {
        let context = self.context;
        let kind = destination.kind();

        if cancel.is_cancelled() {
            progress.set_upload(kind, UploadState::Failed("cancelled".to_string()));
            return DestinationOutcome::Cancelled;
        }

        progress.set_upload(kind, UploadState::InProgress);

        let sink = match self.connector.connect(destination) {
            Ok(sink) => sink,
            Err(e) => {
                error!("{context}Could not connect to the {kind} destination: {e}");
                progress.set_upload(kind, UploadState::Failed(e.to_string()));
                return DestinationOutcome::Failed(e.to_string());
            }
        };

        let key = object_key(&[
            destination.remote_folder_name(),
            target.folder_name,
            target.file_name,
        ]);

        match sink.upload(&key, target.artifact, cancel) {
            Ok(()) => {}
            Err(SinkError::Cancelled) => {
                warn!("{context}Upload to {kind} was cancelled");
                progress.set_upload(kind, UploadState::Failed("cancelled".to_string()));
                return DestinationOutcome::Cancelled;
            }
            Err(e) => {
                error!("{context}Failed to upload to {kind}: {e}");
                progress.set_upload(kind, UploadState::Failed(e.to_string()));
                return DestinationOutcome::Failed(e.to_string());
            }
        }

        info!("{context}Uploaded '{key}' to {kind}");
        progress.set_upload(kind, UploadState::Uploaded);

        if let Some(retention) = retention {
            if sink.supports_listing() {
                let tree = RemoteBackupTree::new(sink.as_ref(), destination.remote_folder_name());
                let runner = RetentionPolicyRunner::new(retention.policy, retention.database, context);

                match runner.execute(&tree, retention.now) {
                    Ok(report) if !report.deleted.is_empty() => progress.add_info(format!(
                        "Deleted {} expired sets from {kind}",
                        report.deleted.len()
                    )),
                    Ok(_) => {}
                    Err(e) => warn!("{context}Retention on {kind} failed: {e}"),
                }
            }
        }

        DestinationOutcome::Uploaded
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("The {0} destination can't {1}")]
    Unsupported(DestinationKind, &'static str),

    #[error("No connector for the {0} destination")]
    NoConnector(DestinationKind),

    #[error("The remote rejected the request: {0}")]
    Remote(String),

    #[error("The upload was cancelled")]
    Cancelled,
}

/// One or more destinations failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Failed to upload to {count} destinations:{details}",
    count = .failures.len(),
    details = format_failures(.failures)
)]
pub struct UploadError {
    /// The failed destinations and their errors.
    pub failures: Vec<(DestinationKind, String)>,
}

fn format_failures(failures: &[(DestinationKind, String)]) -> String {
    let mut message = String::new();
    for (kind, error) in failures {
        let _ = write!(message, "\n{kind}: {error}");
    }
    message
}
