//! # periodic-backup
//! Incremental backups of a replicated document database.
//!
//! A run exports everything that changed since the last recorded watermarks,
//! optionally encrypts it, commits the artifact locally, prunes expired sets,
//! uploads to the configured destinations and replicates the new status
//! through the cluster.
//!

pub mod alert;
pub mod cluster;
pub mod config;
pub mod context;
pub mod encryption;
pub mod export;
pub mod naming;
pub mod orchestrator;
pub mod persistence;
pub mod progress;
pub mod retention;
pub mod scheduler;
pub mod settings;
pub mod standalone;
pub mod status;
pub mod upload;

pub use config::{BackupDefinition, Config};
pub use orchestrator::{BackupOrchestrator, BackupRunError};
pub use progress::{BackupProgress, BackupResult, ProgressReporter, RunOutcome};
pub use scheduler::BackupScheduler;
pub use status::BackupStatus;
