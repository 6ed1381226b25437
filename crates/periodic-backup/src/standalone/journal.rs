//! A database stored as a JSON lines journal of document changes
//!

use core::iter;
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, ErrorKind, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{CancellationToken, CheckCancelled};
use tracing::warn;

use crate::{
    encryption::EncryptionKey,
    export::{
        CompareExchangeEntry, CompareExchangeTombstone, Conflict, CounterGroup, DatabaseRecord,
        Document, DocumentDatabase, ExportError, Identity, IndexDefinition, ItemIter,
        SnapshotFile, StorageView, SubscriptionState, Tombstone,
    },
};

/// One change in the journal. The change's position, from 1, is its etag.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Put {
        id: String,
        #[serde(default)]
        collection: String,
        data: Value,
    },
    Delete {
        id: String,
        #[serde(default)]
        collection: String,
    },
}

impl JournalEntry {
    fn id(&self) -> &str {
        match self {
            Self::Put { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// A database whose storage is its change journal.
#[derive(Debug, Clone)]
pub struct JournalDatabase {
    name: String,
    path: PathBuf,
}

impl JournalDatabase {
    /// A database named `name` journaled at `path`. A missing journal is empty.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Append a change, returning its etag.
    pub fn append(&self, entry: &JournalEntry) -> Result<u64, ExportError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ExportError::Io(e, "open the journal"))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ExportError::Io(e, "append to the journal"))?;

        Ok(etag(self.entries()?.len()))
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, ExportError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ExportError::Io(e, "open the journal")),
        };

        let mut entries = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ExportError::Io(e, "read the journal"))?;
            if line.trim().is_empty() {
                continue;
            }

            let entry = serde_json::from_str(&line).map_err(|e| {
                ExportError::OpenView(format!("Line {} of the journal is invalid: {e}", number + 1))
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| "journal".to_string(), |name| name.to_string_lossy().to_string())
    }
}

fn etag(position: usize) -> u64 {
    u64::try_from(position).unwrap_or(u64::MAX)
}

/// The latest change of every document.
struct JournalView {
    record: DatabaseRecord,
    watermark: u64,
    documents: Vec<Document>,
    tombstones: Vec<Tombstone>,
}

impl JournalView {
    fn new(name: &str, entries: Vec<JournalEntry>) -> Self {
        let watermark = etag(entries.len());

        let mut latest = BTreeMap::new();
        for (position, entry) in entries.into_iter().enumerate() {
            latest.insert(entry.id().to_string(), (etag(position + 1), entry));
        }

        let mut documents = Vec::new();
        let mut tombstones = Vec::new();
        for (etag, entry) in latest.into_values() {
            match entry {
                JournalEntry::Put {
                    id,
                    collection,
                    data,
                } => documents.push(Document {
                    id,
                    etag,
                    change_vector: format!("{name}:{etag}"),
                    collection,
                    data,
                }),
                JournalEntry::Delete { id, collection } => tombstones.push(Tombstone {
                    id,
                    etag,
                    collection,
                }),
            }
        }
        documents.sort_by_key(|document| document.etag);
        tombstones.sort_by_key(|tombstone| tombstone.etag);

        Self {
            record: DatabaseRecord {
                name: name.to_string(),
                encrypted: false,
                periodic_backups: Vec::new(),
                other: Map::new(),
            },
            watermark,
            documents,
            tombstones,
        }
    }
}

impl StorageView for JournalView {
    fn document_watermark(&self) -> u64 {
        self.watermark
    }

    fn cluster_watermark(&self) -> u64 {
        0
    }

    fn database_record(&self) -> DatabaseRecord {
        self.record.clone()
    }

    fn revisions_configured(&self) -> bool {
        false
    }

    fn documents(&self, start: u64) -> ItemIter<'_, Document> {
        Box::new(
            self.documents
                .iter()
                .filter(move |document| document.etag >= start)
                .cloned(),
        )
    }

    fn revisions(&self, _start: u64) -> ItemIter<'_, Document> {
        Box::new(iter::empty())
    }

    fn tombstones(&self, start: u64) -> ItemIter<'_, Tombstone> {
        Box::new(
            self.tombstones
                .iter()
                .filter(move |tombstone| tombstone.etag >= start)
                .cloned(),
        )
    }

    fn conflicts(&self, _start: u64) -> ItemIter<'_, Conflict> {
        Box::new(iter::empty())
    }

    fn identities(&self, _start: u64) -> ItemIter<'_, Identity> {
        Box::new(iter::empty())
    }

    fn compare_exchange(&self, _start: u64) -> ItemIter<'_, CompareExchangeEntry> {
        Box::new(iter::empty())
    }

    fn compare_exchange_tombstones(&self, _start: u64) -> ItemIter<'_, CompareExchangeTombstone> {
        Box::new(iter::empty())
    }

    fn counters(&self, _start: u64) -> ItemIter<'_, CounterGroup> {
        Box::new(iter::empty())
    }

    fn subscriptions(&self, _start: u64) -> ItemIter<'_, SubscriptionState> {
        Box::new(iter::empty())
    }
}

impl DocumentDatabase for JournalDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn master_key(&self) -> Option<EncryptionKey> {
        None
    }

    fn last_document_watermark(&self) -> u64 {
        match self.entries() {
            Ok(entries) => etag(entries.len()),
            Err(e) => {
                warn!("[{}] Could not read the journal: {e}", self.name);
                0
            }
        }
    }

    fn last_cluster_watermark(&self) -> u64 {
        0
    }

    fn open_view(&self) -> Result<Box<dyn StorageView + '_>, ExportError> {
        Ok(Box::new(JournalView::new(&self.name, self.entries()?)))
    }

    fn index_definitions(&self) -> Vec<IndexDefinition> {
        Vec::new()
    }

    fn copy_storage_to(
        &self,
        out: &mut dyn Write,
        on_file: &mut dyn FnMut(&SnapshotFile),
        cancel: &CancellationToken,
    ) -> Result<(), ExportError> {
        cancel.check().map_err(|_| ExportError::Cancelled)?;

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ExportError::Io(e, "open the journal")),
        };

        let name = self.file_name();
        out.write_all(format!("{name}\n").as_bytes())
            .map_err(|e| ExportError::Io(e, "write a storage file"))?;
        let bytes =
            io::copy(&mut file, out).map_err(|e| ExportError::Io(e, "write a storage file"))?;

        on_file(&SnapshotFile { name, bytes });

        Ok(())
    }
}
