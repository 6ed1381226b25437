//! Backup definitions and the runner's config
//!

use core::{fmt, time::Duration};
use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use shared::{Cadence, LogConfig};
use thiserror::Error;

use crate::{
    encryption::{EncryptionError, EncryptionKey},
    retention::RetentionPolicy,
    standalone::StandaloneConfig,
};

/// Task names starting with this prefix belong to server-wide backup tasks.
pub const SERVER_WIDE_NAME_PREFIX: &str = "Server Wide Backup, ";

/// What a full backup contains.
#[derive(Hash, Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackupKind {
    /// A logical export of every item type.
    #[default]
    Backup,

    /// A binary copy of the storage files. Incremental runs still use the logical export.
    Snapshot,
}

impl BackupKind {
    /// The lowercase name used in set folder names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Snapshot => "snapshot",
        }
    }
}

/// A command whose standard output is the JSON settings of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackupConfigurationScript {
    /// The program to run.
    pub exec: String,

    /// The program's arguments.
    #[serde(default)]
    pub arguments: Vec<String>,

    /// How long the program may run.
    #[serde(default = "BackupConfigurationScript::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl BackupConfigurationScript {
    fn default_timeout_ms() -> u64 {
        10_000
    }
}

/// Keep backups in a local folder.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LocalSettings {
    /// The folder that holds one sub folder per backup set.
    pub folder_path: PathBuf,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// Copy backups to another local folder, such as a mounted share.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LocalFolderCopySettings {
    /// The folder to copy into.
    pub folder_path: PathBuf,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// Upload backups to an S3 bucket.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct S3Settings {
    /// The bucket name.
    pub bucket_name: String,
    /// The AWS region.
    pub region_name: String,
    /// The prefix every set is stored under.
    #[serde(default)]
    pub remote_folder_name: String,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// Upload backups to an Azure blob container.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AzureSettings {
    /// The storage account.
    pub account_name: String,
    /// The blob container.
    pub storage_container: String,
    /// The prefix every set is stored under.
    #[serde(default)]
    pub remote_folder_name: String,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// Upload backups to a Glacier vault.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GlacierSettings {
    /// The vault name.
    pub vault_name: String,
    /// The AWS region.
    pub region_name: String,
    /// The prefix every set is stored under.
    #[serde(default)]
    pub remote_folder_name: String,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// Upload backups to a Google Cloud Storage bucket.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GoogleCloudSettings {
    /// The bucket name.
    pub bucket_name: String,
    /// The prefix every set is stored under.
    #[serde(default)]
    pub remote_folder_name: String,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// Upload backups to an FTP server.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FtpSettings {
    /// The server url.
    pub url: String,
    /// The server port, the scheme default if not set.
    pub port: Option<u16>,
    /// The folder every set is stored under.
    #[serde(default)]
    pub remote_folder_name: String,

    /// Fetch these settings from a command instead.
    #[serde(default)]
    pub get_backup_configuration_script: Option<BackupConfigurationScript>,
}

/// A place a finished backup is copied to.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Destination {
    LocalFolder(LocalFolderCopySettings),
    S3(S3Settings),
    Azure(AzureSettings),
    Glacier(GlacierSettings),
    GoogleCloud(GoogleCloudSettings),
    Ftp(FtpSettings),
}

/// The kind of a destination. A definition may configure each kind at most once.
#[allow(missing_docs)]
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DestinationKind {
    LocalFolder,
    S3,
    Azure,
    Glacier,
    GoogleCloud,
    Ftp,
}

impl DestinationKind {
    /// Every destination kind.
    pub const ALL: [Self; 6] = [
        Self::LocalFolder,
        Self::S3,
        Self::Azure,
        Self::Glacier,
        Self::GoogleCloud,
        Self::Ftp,
    ];
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalFolder => "local folder",
            Self::S3 => "S3",
            Self::Azure => "Azure",
            Self::Glacier => "Glacier",
            Self::GoogleCloud => "Google Cloud",
            Self::Ftp => "FTP",
        };

        write!(f, "{name}")
    }
}

impl Destination {
    /// The destination's kind.
    pub fn kind(&self) -> DestinationKind {
        match self {
            Self::LocalFolder(_) => DestinationKind::LocalFolder,
            Self::S3(_) => DestinationKind::S3,
            Self::Azure(_) => DestinationKind::Azure,
            Self::Glacier(_) => DestinationKind::Glacier,
            Self::GoogleCloud(_) => DestinationKind::GoogleCloud,
            Self::Ftp(_) => DestinationKind::Ftp,
        }
    }

    /// The prefix sets are stored under, empty for the root.
    pub fn remote_folder_name(&self) -> &str {
        match self {
            Self::LocalFolder(_) => "",
            Self::S3(settings) => &settings.remote_folder_name,
            Self::Azure(settings) => &settings.remote_folder_name,
            Self::Glacier(settings) => &settings.remote_folder_name,
            Self::GoogleCloud(settings) => &settings.remote_folder_name,
            Self::Ftp(settings) => &settings.remote_folder_name,
        }
    }

    /// Check the mandatory settings are present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let missing = match self {
            Self::LocalFolder(settings) => {
                settings.folder_path.as_os_str().is_empty().then_some("folder_path")
            }
            Self::S3(settings) => settings.bucket_name.is_empty().then_some("bucket_name"),
            Self::Azure(settings) => settings
                .storage_container
                .is_empty()
                .then_some("storage_container"),
            Self::Glacier(settings) => settings.vault_name.is_empty().then_some("vault_name"),
            Self::GoogleCloud(settings) => {
                settings.bucket_name.is_empty().then_some("bucket_name")
            }
            Self::Ftp(settings) => settings.url.is_empty().then_some("url"),
        };

        match missing {
            Some(setting) => Err(ValidationError::MissingDestinationSetting(
                self.kind(),
                setting,
            )),
            None => Ok(()),
        }
    }
}

/// How the backup output is encrypted.
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Never encrypt, even if the database has a key.
    None,

    /// Encrypt with the database's master key.
    UseDatabaseKey,

    /// Encrypt with the key in the settings.
    UseProvidedKey,
}

/// Backup encryption settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// The encryption mode.
    pub mode: EncryptionMode,

    /// A base64 encoded 256 bit key, used by `UseProvidedKey`.
    #[serde(default)]
    pub key: Option<String>,
}

/// A periodic backup task of one database.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackupDefinition {
    /// The cluster wide id of the task.
    pub task_id: u64,

    /// The task's name.
    pub name: String,

    /// What a full backup contains.
    #[serde(default)]
    pub kind: BackupKind,

    /// Disabled tasks are never scheduled.
    #[serde(default)]
    pub disabled: bool,

    /// How often to run a full backup.
    #[serde(default)]
    pub full_backup_cadence: Option<Cadence>,

    /// How often to run an incremental backup.
    #[serde(default)]
    pub incremental_backup_cadence: Option<Cadence>,

    /// The local folder to keep backups in.
    #[serde(default)]
    pub local: Option<LocalSettings>,

    /// Where finished backups are copied to.
    #[serde(default)]
    pub destinations: Vec<Destination>,

    /// How the output is encrypted.
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,

    /// When old sets are deleted.
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
}

impl BackupDefinition {
    /// If this task was created by a server-wide backup configuration.
    pub fn is_server_wide(&self) -> bool {
        self.name
            .to_lowercase()
            .starts_with(&SERVER_WIDE_NAME_PREFIX.to_lowercase())
    }

    /// The retention policy, if enabled.
    pub fn active_retention(&self) -> Option<&RetentionPolicy> {
        self.retention.as_ref().filter(|policy| !policy.disabled)
    }

    /// Check the definition can run, before any I/O happens.
    pub fn validate(&self, master_key_present: bool, is_full: bool) -> Result<(), ValidationError> {
        if let Some(encryption) = &self.encryption {
            match encryption.mode {
                EncryptionMode::None => {}
                EncryptionMode::UseDatabaseKey => {
                    if !master_key_present {
                        return Err(ValidationError::MissingDatabaseKey);
                    }
                }
                EncryptionMode::UseProvidedKey => {
                    let key = encryption
                        .key
                        .as_deref()
                        .ok_or(ValidationError::MissingProvidedKey)?;
                    EncryptionKey::from_base64(key)?;

                    if self.kind == BackupKind::Snapshot && is_full {
                        return Err(ValidationError::SnapshotWithProvidedKey);
                    }
                }
            }
        }

        if let Some(retention) = self.active_retention() {
            retention.validate()?;
        }

        if let Some(local) = &self.local {
            if local.folder_path.as_os_str().is_empty() {
                return Err(ValidationError::MissingLocalFolder);
            }
        }

        let mut seen = Vec::with_capacity(self.destinations.len());
        for destination in &self.destinations {
            let kind = destination.kind();
            if seen.contains(&kind) {
                return Err(ValidationError::DuplicateDestination(kind));
            }
            seen.push(kind);

            destination.validate()?;
        }

        Ok(())
    }
}

/// Check a task's name against the other tasks of the same database.
pub fn validate_task_name(
    existing: &[BackupDefinition],
    definition: &BackupDefinition,
    server_wide: bool,
) -> Result<(), ValidationError> {
    if definition.name.trim().is_empty() {
        return Err(ValidationError::EmptyTaskName);
    }

    if !server_wide && definition.is_server_wide() {
        return Err(ValidationError::ReservedTaskName(definition.name.clone()));
    }

    let duplicate = existing.iter().any(|other| {
        other.task_id != definition.task_id && other.name.eq_ignore_ascii_case(&definition.name)
    });
    if duplicate {
        return Err(ValidationError::DuplicateTaskName(definition.name.clone()));
    }

    Ok(())
}

/// The backup runner's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where artifacts are staged when a definition has no local folder.
    pub temp_path: PathBuf,

    /// How long to wait for the cluster to commit a status update.
    pub status_commit_timeout_seconds: u64,

    /// The logger's config.
    pub logging: LogConfig,

    /// The node the runner backs up when run on its own.
    #[serde(default)]
    pub standalone: StandaloneConfig,

    /// The backup tasks.
    #[serde(default)]
    pub definitions: Vec<BackupDefinition>,
}

impl Config {
    /// Tries to load a config from a toml file.
    pub fn load_toml(file_path: PathBuf) -> Result<Self, LoadConfigError> {
        if !file_path.exists() {
            return Err(LoadConfigError::NoFile);
        }

        let contents = fs::read_to_string(file_path).map_err(LoadConfigError::Read)?;
        let config = toml::from_str(&contents)?;

        Ok(config)
    }

    /// The status commit timeout.
    pub fn status_commit_timeout(&self) -> Duration {
        Duration::from_secs(self.status_commit_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_path: PathBuf::from("./backup-temp"),
            status_commit_timeout_seconds: 30,
            logging: LogConfig::default(),
            standalone: StandaloneConfig::default(),
            definitions: Vec::new(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("The file does not exist.")]
    NoFile,

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to deserialize the file:\n{0}")]
    Deserialize(#[from] toml::de::Error),
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Can't use the database key for backup encryption, the key doesn't exist")]
    MissingDatabaseKey,

    #[error("Encryption mode UseProvidedKey requires a key")]
    MissingProvidedKey,

    #[error("The provided encryption key is invalid: {0}")]
    InvalidProvidedKey(#[from] EncryptionError),

    #[error("Can't snapshot an encrypted database with a different key")]
    SnapshotWithProvidedKey,

    #[error("MinimumBackupAgeToKeep must be positive")]
    RetentionNotPositive,

    #[error("MinimumBackupAgeToKeep must be bigger than one day, was {0:?}")]
    RetentionTooShort(Duration),

    #[error("The local folder path is empty")]
    MissingLocalFolder,

    #[error("The {0} destination is configured more than once")]
    DuplicateDestination(DestinationKind),

    #[error("The {0} destination is missing the '{1}' setting")]
    MissingDestinationSetting(DestinationKind, &'static str),

    #[error("The task name is empty")]
    EmptyTaskName,

    #[error(
        "Task name '{0}' can't start with '{prefix}', it is reserved for server-wide backup tasks",
        prefix = SERVER_WIDE_NAME_PREFIX
    )]
    ReservedTaskName(String),

    #[error("There is already a backup task named '{0}'")]
    DuplicateTaskName(String),
}
