//! # common
//! In memory collaborators for the backup tests.
//!

#![allow(dead_code)]

use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeZone, Utc};
use periodic_backup::{
    BackupDefinition, BackupOrchestrator, BackupResult, BackupRunError, BackupStatus, Config,
    ProgressReporter,
    alert::{Alert, AlertSink},
    cluster::{ClusterClient, ClusterCommand, ClusterError, CommitIndexWatch},
    config::{BackupKind, Destination, DestinationKind, LocalSettings},
    encryption::EncryptionKey,
    export::{
        CompareExchangeEntry, CompareExchangeTombstone, Conflict, CounterGroup, DatabaseRecord,
        Document, DocumentDatabase, ExportError, Identity, IndexDefinition, ItemIter,
        SnapshotFile, StorageView, SubscriptionState, Tombstone,
    },
    upload::{RemoteSink, SinkConnector, SinkError},
};
use serde_json::{Map, Value, json};
use shared::{CancellationToken, Clock, test::ManualClock};
use tempfile::TempDir;

pub const DATABASE: &str = "Northwind";
pub const NODE_TAG: &str = "A";

/// Midnight on the first of January 2024.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn hours(hours: u64) -> Duration {
    Duration::from_secs(hours * 60 * 60)
}

/// A backup definition with no destinations.
pub fn definition(task_id: u64, name: &str) -> BackupDefinition {
    BackupDefinition {
        task_id,
        name: name.to_string(),
        kind: BackupKind::Backup,
        disabled: false,
        full_backup_cadence: None,
        incremental_backup_cadence: None,
        local: None,
        destinations: Vec::new(),
        encryption: None,
        retention: None,
    }
}

/// A backup definition keeping backups in `folder`.
pub fn local_definition(task_id: u64, folder: &Path) -> BackupDefinition {
    BackupDefinition {
        local: Some(LocalSettings {
            folder_path: folder.to_path_buf(),
            ..LocalSettings::default()
        }),
        ..definition(task_id, "Local backup")
    }
}

/// Every file below `root`, relative to it, sorted.
pub fn files_below(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(directory) = pending.pop() {
        let Ok(entries) = fs::read_dir(&directory) else {
            continue;
        };

        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    files.sort();
    files
}

/// The immediate sub folders of `root`, sorted.
pub fn folders_in(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut folders: Vec<String> = entries
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    folders.sort();
    folders
}

#[derive(Debug, Clone)]
pub struct DatabaseState {
    pub name: String,
    pub master_key: Option<EncryptionKey>,
    pub document_watermark: u64,
    pub cluster_watermark: u64,
    pub record: DatabaseRecord,
    pub revisions_configured: bool,
    pub documents: Vec<Document>,
    pub revisions: Vec<Document>,
    pub tombstones: Vec<Tombstone>,
    pub conflicts: Vec<Conflict>,
    pub indexes: Vec<IndexDefinition>,
    pub identities: Vec<Identity>,
    pub compare_exchange: Vec<CompareExchangeEntry>,
    pub compare_exchange_tombstones: Vec<CompareExchangeTombstone>,
    pub counters: Vec<CounterGroup>,
    pub subscriptions: Vec<SubscriptionState>,
    pub storage_files: Vec<(String, Vec<u8>)>,
}

/// A database held in memory. Views are copies of the state.
#[derive(Debug)]
pub struct InMemoryDatabase {
    state: Mutex<DatabaseState>,
}

impl InMemoryDatabase {
    pub fn new(name: &str) -> Self {
        let state = DatabaseState {
            name: name.to_string(),
            master_key: None,
            document_watermark: 0,
            cluster_watermark: 0,
            record: DatabaseRecord {
                name: name.to_string(),
                encrypted: false,
                periodic_backups: Vec::new(),
                other: Map::new(),
            },
            revisions_configured: true,
            documents: Vec::new(),
            revisions: Vec::new(),
            tombstones: Vec::new(),
            conflicts: Vec::new(),
            indexes: Vec::new(),
            identities: Vec::new(),
            compare_exchange: Vec::new(),
            compare_exchange_tombstones: Vec::new(),
            counters: Vec::new(),
            subscriptions: Vec::new(),
            storage_files: vec![
                ("Raven.voron".to_string(), vec![7u8; 4096]),
                ("Journals/0000000001.journal".to_string(), vec![3u8; 1024]),
            ],
        };

        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_state<T>(&self, change: impl FnOnce(&mut DatabaseState) -> T) -> T {
        change(&mut self.state.lock().unwrap())
    }

    pub fn set_master_key(&self, key: Option<EncryptionKey>) {
        self.with_state(|state| state.master_key = key);
    }

    /// Store a document, returning its etag.
    pub fn put_document(&self, id: &str, data: Value) -> u64 {
        self.with_state(|state| {
            state.document_watermark += 1;
            let etag = state.document_watermark;

            if let Some(existing) = state.documents.iter().position(|doc| doc.id == id) {
                let previous = state.documents.remove(existing);
                if state.revisions_configured {
                    state.revisions.push(previous);
                }
            }

            state.documents.push(Document {
                id: id.to_string(),
                etag,
                change_vector: format!("A:{etag}"),
                collection: "Orders".to_string(),
                data,
            });

            etag
        })
    }

    /// Delete a document, returning the tombstone's etag.
    pub fn delete_document(&self, id: &str) -> u64 {
        self.with_state(|state| {
            state.document_watermark += 1;
            let etag = state.document_watermark;

            state.documents.retain(|doc| doc.id != id);
            state.tombstones.push(Tombstone {
                id: id.to_string(),
                etag,
                collection: "Orders".to_string(),
            });

            etag
        })
    }

    /// Store a compare exchange value, returning its cluster index.
    pub fn put_compare_exchange(&self, key: &str, value: Value) -> u64 {
        self.with_state(|state| {
            state.cluster_watermark += 1;
            let index = state.cluster_watermark;

            state.compare_exchange.retain(|entry| entry.key != key);
            state.compare_exchange.push(CompareExchangeEntry {
                key: key.to_string(),
                value,
                index,
            });

            index
        })
    }

    pub fn delete_compare_exchange(&self, key: &str) -> u64 {
        self.with_state(|state| {
            state.cluster_watermark += 1;
            let index = state.cluster_watermark;

            state.compare_exchange.retain(|entry| entry.key != key);
            state
                .compare_exchange_tombstones
                .push(CompareExchangeTombstone {
                    key: key.to_string(),
                    index,
                });

            index
        })
    }

    pub fn put_identity(&self, name: &str, value: u64) -> u64 {
        self.with_state(|state| {
            state.cluster_watermark += 1;
            let index = state.cluster_watermark;

            state.identities.retain(|identity| identity.name != name);
            state.identities.push(Identity {
                name: name.to_string(),
                value,
                index,
            });

            index
        })
    }

    pub fn add_index(&self, definition: IndexDefinition) {
        self.with_state(|state| state.indexes.push(definition));
    }

    /// Seed a few documents and a compare exchange value.
    pub fn seed(&self) {
        self.put_document("orders/1", json!({ "Company": "companies/1" }));
        self.put_document("orders/2", json!({ "Company": "companies/2" }));
        self.put_document("orders/3", json!({ "Company": "companies/3" }));
        self.put_compare_exchange("locks/orders", json!({ "Owner": "A" }));
    }
}

pub struct StateView {
    state: DatabaseState,
}

fn from_etag<'a, T: Clone + 'a>(
    items: &'a [T],
    start: u64,
    watermark: impl Fn(&T) -> u64 + 'a,
) -> ItemIter<'a, T> {
    Box::new(
        items
            .iter()
            .filter(move |item| watermark(*item) >= start)
            .cloned(),
    )
}

impl StorageView for StateView {
    fn document_watermark(&self) -> u64 {
        self.state.document_watermark
    }

    fn cluster_watermark(&self) -> u64 {
        self.state.cluster_watermark
    }

    fn database_record(&self) -> DatabaseRecord {
        self.state.record.clone()
    }

    fn revisions_configured(&self) -> bool {
        self.state.revisions_configured
    }

    fn documents(&self, start: u64) -> ItemIter<'_, Document> {
        from_etag(&self.state.documents, start, |item| item.etag)
    }

    fn revisions(&self, start: u64) -> ItemIter<'_, Document> {
        from_etag(&self.state.revisions, start, |item| item.etag)
    }

    fn tombstones(&self, start: u64) -> ItemIter<'_, Tombstone> {
        from_etag(&self.state.tombstones, start, |item| item.etag)
    }

    fn conflicts(&self, start: u64) -> ItemIter<'_, Conflict> {
        from_etag(&self.state.conflicts, start, |item| item.etag)
    }

    fn identities(&self, start: u64) -> ItemIter<'_, Identity> {
        from_etag(&self.state.identities, start, |item| item.index)
    }

    fn compare_exchange(&self, start: u64) -> ItemIter<'_, CompareExchangeEntry> {
        from_etag(&self.state.compare_exchange, start, |item| item.index)
    }

    fn compare_exchange_tombstones(&self, start: u64) -> ItemIter<'_, CompareExchangeTombstone> {
        from_etag(&self.state.compare_exchange_tombstones, start, |item| item.index)
    }

    fn counters(&self, start: u64) -> ItemIter<'_, CounterGroup> {
        from_etag(&self.state.counters, start, |item| item.etag)
    }

    fn subscriptions(&self, start: u64) -> ItemIter<'_, SubscriptionState> {
        from_etag(&self.state.subscriptions, start, |item| item.index)
    }
}

impl DocumentDatabase for InMemoryDatabase {
    fn name(&self) -> &str {
        DATABASE
    }

    fn master_key(&self) -> Option<EncryptionKey> {
        self.with_state(|state| state.master_key.clone())
    }

    fn last_document_watermark(&self) -> u64 {
        self.with_state(|state| state.document_watermark)
    }

    fn last_cluster_watermark(&self) -> u64 {
        self.with_state(|state| state.cluster_watermark)
    }

    fn open_view(&self) -> Result<Box<dyn StorageView + '_>, ExportError> {
        let state = self.with_state(|state| state.clone());
        Ok(Box::new(StateView { state }))
    }

    fn index_definitions(&self) -> Vec<IndexDefinition> {
        self.with_state(|state| state.indexes.clone())
    }

    fn copy_storage_to(
        &self,
        out: &mut dyn Write,
        on_file: &mut dyn FnMut(&SnapshotFile),
        cancel: &CancellationToken,
    ) -> Result<(), ExportError> {
        let files = self.with_state(|state| state.storage_files.clone());

        for (name, contents) in files {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }

            out.write_all(format!("{name}\n").as_bytes())
                .map_err(|e| ExportError::Io(e, "write a storage file"))?;
            out.write_all(&contents)
                .map_err(|e| ExportError::Io(e, "write a storage file"))?;

            on_file(&SnapshotFile {
                name,
                bytes: u64::try_from(contents.len()).unwrap(),
            });
        }

        Ok(())
    }
}

/// A single node cluster.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    pub commits: CommitIndexWatch,
    pub fail_submit: AtomicBool,
    pub manual_commit: AtomicBool,
    last_index: Mutex<u64>,
    commands: Mutex<Vec<ClusterCommand>>,
    statuses: Mutex<HashMap<(String, u64), BackupStatus>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, database: &str, task_id: u64) -> Option<BackupStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&(database.to_string(), task_id))
            .cloned()
    }

    pub fn commands(&self) -> Vec<ClusterCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn last_index(&self) -> u64 {
        *self.last_index.lock().unwrap()
    }
}

impl ClusterClient for InMemoryCluster {
    fn node_tag(&self) -> String {
        NODE_TAG.to_string()
    }

    fn send_to_leader(&self, command: ClusterCommand) -> Result<u64, ClusterError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("no leader".to_string()));
        }

        let index = {
            let mut last_index = self.last_index.lock().unwrap();
            *last_index += 1;
            *last_index
        };

        let ClusterCommand::UpdateBackupStatus {
            database, status, ..
        } = &command;
        self.statuses
            .lock()
            .unwrap()
            .insert((database.clone(), status.task_id), status.clone());
        self.commands.lock().unwrap().push(command);

        if !self.manual_commit.load(Ordering::SeqCst) {
            self.commits.advance(index);
        }

        Ok(index)
    }

    fn wait_for_commit(&self, index: u64, timeout: Duration) -> Result<(), ClusterError> {
        self.commits.wait_at_least(index, timeout)
    }

    fn backup_status(
        &self,
        database: &str,
        task_id: u64,
    ) -> Result<Option<BackupStatus>, ClusterError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("no leader".to_string()));
        }

        Ok(self.status(database, task_id))
    }
}

/// An object store held in memory.
#[derive(Debug)]
pub struct MemorySink {
    pub kind: DestinationKind,
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fail_upload: AtomicBool,
    pub listing: bool,
    /// Deleting a key containing this fails.
    pub fail_delete: Mutex<Option<String>>,
}

impl MemorySink {
    pub fn new(kind: DestinationKind) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            fail_upload: AtomicBool::new(false),
            listing: kind != DestinationKind::Glacier,
            fail_delete: Mutex::new(None),
        }
    }

    pub fn failing(kind: DestinationKind) -> Self {
        let sink = Self::new(kind);
        sink.fail_upload.store(true, Ordering::SeqCst);
        sink
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn insert(&self, key: &str, contents: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), contents.to_vec());
    }
}

fn with_slash(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix.trim_end_matches('/'))
    }
}

impl RemoteSink for MemorySink {
    fn kind(&self) -> DestinationKind {
        self.kind
    }

    fn upload(
        &self,
        key: &str,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }

        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(SinkError::Remote("503 Service Unavailable".to_string()));
        }

        let contents = fs::read(source).map_err(|e| SinkError::Io(e, "read the artifact"))?;
        self.insert(key, &contents);

        Ok(())
    }

    fn supports_listing(&self) -> bool {
        self.listing
    }

    fn list_folders(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        let prefix = with_slash(prefix);
        let mut folders: Vec<String> = self
            .keys()
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split_once('/'))
            .map(|(folder, _)| folder.to_string())
            .collect();
        folders.dedup();

        Ok(folders)
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        let prefix = with_slash(prefix);
        Ok(self
            .keys()
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn delete_object(&self, key: &str) -> Result<(), SinkError> {
        if let Some(pattern) = self.fail_delete.lock().unwrap().as_deref() {
            if key.contains(pattern) {
                return Err(SinkError::Remote(format!("access denied to {key}")));
            }
        }

        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

struct SinkHandle(Arc<MemorySink>);

impl RemoteSink for SinkHandle {
    fn kind(&self) -> DestinationKind {
        self.0.kind()
    }

    fn upload(
        &self,
        key: &str,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        self.0.upload(key, source, cancel)
    }

    fn supports_listing(&self) -> bool {
        self.0.supports_listing()
    }

    fn list_folders(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        self.0.list_folders(prefix)
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        self.0.list_objects(prefix)
    }

    fn delete_object(&self, key: &str) -> Result<(), SinkError> {
        self.0.delete_object(key)
    }
}

/// Connects each destination kind to a shared memory sink.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    sinks: HashMap<DestinationKind, Arc<MemorySink>>,
}

impl MemoryConnector {
    pub fn new(sinks: Vec<MemorySink>) -> Self {
        Self {
            sinks: sinks
                .into_iter()
                .map(|sink| (sink.kind, Arc::new(sink)))
                .collect(),
        }
    }

    pub fn sink(&self, kind: DestinationKind) -> Arc<MemorySink> {
        Arc::clone(&self.sinks[&kind])
    }
}

impl SinkConnector for MemoryConnector {
    fn connect(&self, destination: &Destination) -> Result<Box<dyn RemoteSink>, SinkError> {
        let sink = self
            .sinks
            .get(&destination.kind())
            .ok_or(SinkError::NoConnector(destination.kind()))?;

        Ok(Box::new(SinkHandle(Arc::clone(sink))))
    }
}

/// Keeps every raised alert.
#[derive(Default)]
pub struct RecordingAlerts(Mutex<Vec<Alert>>);

impl RecordingAlerts {
    pub fn raised(&self) -> Vec<Alert> {
        self.0.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn raise(&self, alert: Alert) {
        self.0.lock().unwrap().push(alert);
    }
}

/// An orchestrator wired to in memory collaborators.
pub struct Harness {
    pub directory: TempDir,
    pub database: Arc<InMemoryDatabase>,
    pub cluster: Arc<InMemoryCluster>,
    pub clock: Arc<ManualClock>,
    pub alerts: Arc<RecordingAlerts>,
    pub shutdown: CancellationToken,
    pub orchestrator: BackupOrchestrator,
}

impl Harness {
    pub fn new(connector: Arc<dyn SinkConnector>) -> Self {
        let directory = tempfile::tempdir().unwrap();
        let database = Arc::new(InMemoryDatabase::new(DATABASE));
        let cluster = Arc::new(InMemoryCluster::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let alerts = Arc::new(RecordingAlerts::default());
        let shutdown = CancellationToken::new();

        let config = Config {
            temp_path: directory.path().join("temp"),
            status_commit_timeout_seconds: 5,
            ..Config::default()
        };

        let orchestrator = BackupOrchestrator::new(
            Arc::clone(&database) as Arc<dyn DocumentDatabase>,
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            connector,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&alerts) as Arc<dyn AlertSink>,
            shutdown.clone(),
            &config,
        );

        Self {
            directory,
            database,
            cluster,
            clock,
            alerts,
            shutdown,
            orchestrator,
        }
    }

    pub fn local() -> Self {
        Self::new(Arc::new(periodic_backup::upload::LocalFolderConnector))
    }

    /// The folder local backups are kept in.
    pub fn backups(&self) -> PathBuf {
        self.directory.path().join("backups")
    }

    pub fn temp(&self) -> PathBuf {
        self.directory.path().join("temp")
    }

    pub fn status(&self, task_id: u64) -> Option<BackupStatus> {
        self.cluster.status(DATABASE, task_id)
    }

    /// Run a backup from the last committed status.
    pub fn run(
        &self,
        definition: &BackupDefinition,
        is_full: bool,
    ) -> Result<BackupResult, BackupRunError> {
        let previous = self.status(definition.task_id);
        let abort = self.orchestrator.abort_token();

        self.orchestrator.run(
            definition,
            previous.as_ref(),
            is_full,
            &abort,
            &ProgressReporter::silent(),
        )
    }
}
