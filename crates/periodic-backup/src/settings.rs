//! Resolving the destination settings a run actually uses
//!

use core::time::Duration;
use std::{
    io::{self, Read},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::Instant,
};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    config::{BackupConfigurationScript, BackupDefinition, Destination, LocalSettings},
    upload::object_key,
};

/// The definition with every scripted setting fetched, and the database's
/// own folder added for server-wide tasks.
pub fn resolve_definition(
    definition: &BackupDefinition,
    database: &str,
) -> Result<BackupDefinition, SettingsError> {
    let mut resolved = definition.clone();

    resolved.local = match &definition.local {
        Some(local) => Some(resolve_local(local)?),
        None => None,
    };

    resolved.destinations = definition
        .destinations
        .iter()
        .map(resolve_destination)
        .collect::<Result<_, _>>()?;

    // Server-wide tasks share their settings between databases.
    if definition.is_server_wide() {
        if let Some(local) = &mut resolved.local {
            local.folder_path.push(database);
        }

        for destination in &mut resolved.destinations {
            add_database_folder(destination, database);
        }
    }

    Ok(resolved)
}

fn resolve_local(local: &LocalSettings) -> Result<LocalSettings, SettingsError> {
    from_script(local, local.get_backup_configuration_script.as_ref())
}

fn resolve_destination(destination: &Destination) -> Result<Destination, SettingsError> {
    let resolved = match destination {
        Destination::LocalFolder(settings) => Destination::LocalFolder(from_script(
            settings,
            settings.get_backup_configuration_script.as_ref(),
        )?),
        Destination::S3(settings) => Destination::S3(from_script(
            settings,
            settings.get_backup_configuration_script.as_ref(),
        )?),
        Destination::Azure(settings) => Destination::Azure(from_script(
            settings,
            settings.get_backup_configuration_script.as_ref(),
        )?),
        Destination::Glacier(settings) => Destination::Glacier(from_script(
            settings,
            settings.get_backup_configuration_script.as_ref(),
        )?),
        Destination::GoogleCloud(settings) => Destination::GoogleCloud(from_script(
            settings,
            settings.get_backup_configuration_script.as_ref(),
        )?),
        Destination::Ftp(settings) => Destination::Ftp(from_script(
            settings,
            settings.get_backup_configuration_script.as_ref(),
        )?),
    };

    Ok(resolved)
}

fn add_database_folder(destination: &mut Destination, database: &str) {
    let remote_folder_name = match destination {
        Destination::LocalFolder(settings) => {
            settings.folder_path.push(database);
            return;
        }
        Destination::S3(settings) => &mut settings.remote_folder_name,
        Destination::Azure(settings) => &mut settings.remote_folder_name,
        Destination::Glacier(settings) => &mut settings.remote_folder_name,
        Destination::GoogleCloud(settings) => &mut settings.remote_folder_name,
        Destination::Ftp(settings) => &mut settings.remote_folder_name,
    };

    *remote_folder_name = object_key(&[remote_folder_name, database]);
}

fn from_script<T>(
    settings: &T,
    script: Option<&BackupConfigurationScript>,
) -> Result<T, SettingsError>
where
    T: Clone + DeserializeOwned,
{
    let Some(script) = script.filter(|script| !script.exec.is_empty()) else {
        return Ok(settings.clone());
    };

    let output = run_script(script)?;

    serde_json::from_slice(&output).map_err(|e| SettingsError::Deserialize(script.exec.clone(), e))
}

/// Run a script and return its standard output.
pub fn run_script(script: &BackupConfigurationScript) -> Result<Vec<u8>, SettingsError> {
    let command = script.exec.clone();

    let mut child = Command::new(&script.exec)
        .args(&script.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SettingsError::Start(command.clone(), e))?;

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(SettingsError::Start(
            command,
            io::Error::other("the output was not captured"),
        ));
    };

    let timeout = Duration::from_millis(script.timeout_ms);

    let (status, output, errors) = thread::scope(|scope| {
        let output = scope.spawn(move || {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).map(|_| output)
        });
        let errors = scope.spawn(move || {
            let mut errors = String::new();
            let _ = stderr.read_to_string(&mut errors);
            errors
        });

        let status = wait_with_timeout(&mut child, timeout);

        (
            status,
            output.join().unwrap_or_else(|_| Ok(Vec::new())),
            errors.join().unwrap_or_default(),
        )
    });

    let status = status.map_err(|e| SettingsError::Wait(command.clone(), e))?;
    let Some(status) = status else {
        return Err(SettingsError::TimedOut(command, timeout, errors));
    };

    if !status.success() {
        return Err(SettingsError::ExitCode(command, status.code(), errors));
    }

    output.map_err(|e| SettingsError::Wait(command, e))
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let started = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        if started.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }

        thread::sleep(Duration::from_millis(10));
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Unable to get backup configuration by executing '{0}', failed to start the process: {1}")]
    Start(String, #[source] io::Error),

    #[error("Unable to get backup configuration by executing '{0}': {1}")]
    Wait(String, #[source] io::Error),

    #[error("Unable to get backup configuration by executing '{0}', it didn't exit within {1:?}. Stderr: {2}")]
    TimedOut(String, Duration, String),

    #[error("Unable to get backup configuration by executing '{0}', the exit code was {1:?}. Stderr: {2}")]
    ExitCode(String, Option<i32>, String),

    #[error("The configuration from '{0}' is invalid: {1}")]
    Deserialize(String, #[source] serde_json::Error),
}
