//! # periodic-backup
//! Runs the configured backup tasks of a standalone node.
//!

use core::time::Duration;
use std::{fs, path::PathBuf, process::ExitCode, sync::Arc, thread::sleep};

use mimalloc::MiMalloc;
use periodic_backup::{
    BackupDefinition, BackupOrchestrator, BackupScheduler, Config,
    alert::LogAlertSink,
    config::validate_task_name,
    export::DocumentDatabase,
    standalone::{FileCluster, JournalDatabase},
    upload::LocalFolderConnector,
};
use shared::{CancellationToken, Clock, SystemClock, init_logger};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    let config_path = PathBuf::from("./config.toml");

    // Initialize config if args include 'init'.
    if std::env::args().any(|arg| arg.eq("init")) {
        let written = toml::to_string_pretty(&Config::default())
            .map_err(|e| e.to_string())
            .and_then(|contents| fs::write(&config_path, contents).map_err(|e| e.to_string()));

        return match written {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Could not create the config file: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match Config::load_toml(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load the config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _logger = match init_logger(&config.logging) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Could not start the logger: {e}");
            return ExitCode::FAILURE;
        }
    };

    let host = &config.standalone;
    let database = Arc::new(JournalDatabase::new(&host.database, &host.journal_path));
    let cluster = match FileCluster::open(&host.node_tag, &host.status_path) {
        Ok(cluster) => Arc::new(cluster),
        Err(e) => {
            error!("Could not open the status file: {e}");
            return ExitCode::FAILURE;
        }
    };

    let definitions = runnable_definitions(&config.definitions, database.as_ref());
    if definitions.is_empty() {
        warn!("No backup task can run, check the config");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Arc::new(BackupOrchestrator::new(
        database,
        cluster,
        Arc::new(LocalFolderConnector),
        Arc::clone(&clock),
        Arc::new(LogAlertSink),
        CancellationToken::new(),
        &config,
    ));
    let scheduler = BackupScheduler::new(orchestrator, clock);

    info!("Checking {} backup tasks every {}s", definitions.len(), host.poll_interval_seconds);

    loop {
        for handle in scheduler.run_due(&definitions) {
            let task_id = handle.task_id();
            match handle.join() {
                Ok(result) => info!("Task {task_id} finished: {:?}", result.outcome),
                Err(e) => warn!("Task {task_id} did not finish: {e}"),
            }
        }

        sleep(Duration::from_secs(host.poll_interval_seconds.max(1)));
    }
}

/// The enabled definitions that pass validation.
fn runnable_definitions(
    definitions: &[BackupDefinition],
    database: &dyn DocumentDatabase,
) -> Vec<BackupDefinition> {
    let master_key_present = database.master_key().is_some();

    definitions
        .iter()
        .filter(|definition| !definition.disabled)
        .filter(|definition| {
            let checked = validate_task_name(definitions, definition, true)
                .and_then(|()| definition.validate(master_key_present, true));

            match checked {
                Ok(()) => true,
                Err(e) => {
                    error!("Task '{}' is invalid and won't run: {e}", definition.name);
                    false
                }
            }
        })
        .cloned()
        .collect()
}
