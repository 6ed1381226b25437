//! Watermarked export of database state
//!
//! A session reads one consistent view of the database and yields each item
//! type in a fixed order. Items whose watermark is below the start watermark
//! were captured by an earlier backup and are left out.

use std::{
    collections::BTreeMap,
    io::{self, Write},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{CancellationToken, PathSegment};
use thiserror::Error;

use crate::{config::BackupDefinition, encryption::EncryptionError, encryption::EncryptionKey};

mod artifact;
mod indexes;
mod source;

pub use artifact::{ArtifactContents, ArtifactHeader, ArtifactWriter, read_artifact};
pub use indexes::{REPLACEMENT_PREFIX, coalesce_indexes};
pub use source::{ExportOptions, ExportSession, ExportSource};

/// The item types in export order.
#[allow(missing_docs)]
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemType {
    DatabaseRecord,
    Documents,
    Revisions,
    Tombstones,
    Conflicts,
    Indexes,
    Identities,
    CompareExchange,
    CompareExchangeTombstones,
    Counters,
    Subscriptions,
    End,
}

impl ItemType {
    /// Every item type in export order, ending with `End`.
    pub const ORDER: [Self; 12] = [
        Self::DatabaseRecord,
        Self::Documents,
        Self::Revisions,
        Self::Tombstones,
        Self::Conflicts,
        Self::Indexes,
        Self::Identities,
        Self::CompareExchange,
        Self::CompareExchangeTombstones,
        Self::Counters,
        Self::Subscriptions,
        Self::End,
    ];

    /// If the type is ordered by the cluster watermark instead of the document watermark.
    pub fn uses_cluster_watermark(&self) -> bool {
        matches!(
            self,
            Self::DatabaseRecord
                | Self::Indexes
                | Self::Identities
                | Self::CompareExchange
                | Self::CompareExchangeTombstones
                | Self::Subscriptions
        )
    }
}

/// The document and cluster watermarks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// The per database document change counter.
    pub document: u64,

    /// The cluster log index.
    pub cluster: u64,
}

impl Watermarks {
    /// The higher of each watermark.
    pub fn max(self, other: Self) -> Self {
        Self {
            document: self.document.max(other.document),
            cluster: self.cluster.max(other.cluster),
        }
    }

    /// The first watermarks not captured by a backup that reached these.
    pub fn next(self) -> Self {
        Self {
            document: self.document.saturating_add(1),
            cluster: self.cluster.saturating_add(1),
        }
    }
}

/// A stored document, or a revision of one.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub etag: u64,
    pub change_vector: String,
    pub collection: String,
    pub data: Value,
}

/// A deleted document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub etag: u64,
    pub collection: String,
}

/// A replication conflict waiting to be resolved.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub etag: u64,
    pub change_vector: String,
    pub data: Option<Value>,
}

/// How the index engine sees an index.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Auto,
    Map,
    MapReduce,
    Javascript,
    /// Failed to load, only a placeholder exists.
    Faulty,
}

/// An index definition as the index engine reports it.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub kind: IndexKind,
    pub definition: Value,
}

/// An identity counter.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub value: u64,
    pub index: u64,
}

/// A compare exchange value.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareExchangeEntry {
    pub key: String,
    pub value: Value,
    pub index: u64,
}

/// A deleted compare exchange value.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareExchangeTombstone {
    pub key: String,
    pub index: u64,
}

/// The counters of one document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterGroup {
    pub document_id: String,
    pub etag: u64,
    pub counters: BTreeMap<String, i64>,
}

/// The state of a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub name: String,
    pub query: String,
    pub index: u64,
    pub change_vector: Option<String>,
}

/// The cluster wide record of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    /// The database name.
    pub name: String,

    /// If the database is encrypted at rest.
    #[serde(default)]
    pub encrypted: bool,

    /// The database's backup tasks.
    #[serde(default)]
    pub periodic_backups: Vec<BackupDefinition>,

    /// Everything else in the record.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// One exported item.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Item {
    DatabaseRecord(DatabaseRecord),
    Document(Document),
    Revision(Document),
    Tombstone(Tombstone),
    Conflict(Conflict),
    Index(IndexDefinition),
    Identity(Identity),
    CompareExchange(CompareExchangeEntry),
    CompareExchangeTombstone(CompareExchangeTombstone),
    Counters(CounterGroup),
    Subscription(SubscriptionState),
}

impl Item {
    /// The type the item is exported under.
    pub fn item_type(&self) -> ItemType {
        match self {
            Self::DatabaseRecord(_) => ItemType::DatabaseRecord,
            Self::Document(_) => ItemType::Documents,
            Self::Revision(_) => ItemType::Revisions,
            Self::Tombstone(_) => ItemType::Tombstones,
            Self::Conflict(_) => ItemType::Conflicts,
            Self::Index(_) => ItemType::Indexes,
            Self::Identity(_) => ItemType::Identities,
            Self::CompareExchange(_) => ItemType::CompareExchange,
            Self::CompareExchangeTombstone(_) => ItemType::CompareExchangeTombstones,
            Self::Counters(_) => ItemType::Counters,
            Self::Subscription(_) => ItemType::Subscriptions,
        }
    }
}

/// An item and the watermark it was read under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportItem {
    /// The item's etag or cluster index.
    pub watermark: u64,

    /// The item.
    pub item: Item,
}

/// A boxed iterator borrowed from a view.
pub type ItemIter<'a, T> = Box<dyn Iterator<Item = T> + 'a>;

/// A point in time read view of a database's storage.
///
/// Iterators may start at the watermark they are given or earlier, sessions
/// drop items below the start watermark.
pub trait StorageView {
    /// The highest document etag in the view.
    fn document_watermark(&self) -> u64;

    /// The highest cluster index reflected in the view.
    fn cluster_watermark(&self) -> u64;

    /// The database record.
    fn database_record(&self) -> DatabaseRecord;

    /// If revisions are configured for the database.
    fn revisions_configured(&self) -> bool;

    /// Documents with an etag from `start`, ascending.
    fn documents(&self, start: u64) -> ItemIter<'_, Document>;

    /// Revisions with an etag from `start`, ascending.
    fn revisions(&self, start: u64) -> ItemIter<'_, Document>;

    /// Tombstones with an etag from `start`, ascending.
    fn tombstones(&self, start: u64) -> ItemIter<'_, Tombstone>;

    /// Conflicts with an etag from `start`, ascending.
    fn conflicts(&self, start: u64) -> ItemIter<'_, Conflict>;

    /// Identities changed at or after cluster index `start`.
    fn identities(&self, start: u64) -> ItemIter<'_, Identity>;

    /// Compare exchange values changed at or after cluster index `start`.
    fn compare_exchange(&self, start: u64) -> ItemIter<'_, CompareExchangeEntry>;

    /// Compare exchange tombstones from cluster index `start`.
    fn compare_exchange_tombstones(&self, start: u64) -> ItemIter<'_, CompareExchangeTombstone>;

    /// Counter groups with an etag from `start`, ascending.
    fn counters(&self, start: u64) -> ItemIter<'_, CounterGroup>;

    /// Subscriptions changed at or after cluster index `start`.
    fn subscriptions(&self, start: u64) -> ItemIter<'_, SubscriptionState>;
}

/// A database storage file copied into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    /// The file's path relative to the storage root.
    pub name: String,

    /// The file's size.
    pub bytes: u64,
}

/// The database as the backup task sees it.
pub trait DocumentDatabase: Send + Sync {
    /// The database name.
    fn name(&self) -> &str;

    /// The key the database is encrypted with at rest.
    fn master_key(&self) -> Option<EncryptionKey>;

    /// The current highest document etag.
    fn last_document_watermark(&self) -> u64;

    /// The current highest cluster index reflected in the database.
    fn last_cluster_watermark(&self) -> u64;

    /// Open a consistent read view.
    fn open_view(&self) -> Result<Box<dyn StorageView + '_>, ExportError>;

    /// The index definitions.
    fn index_definitions(&self) -> Vec<IndexDefinition>;

    /// Copy the storage files into `out`, reporting each copied file.
    fn copy_storage_to(
        &self,
        out: &mut dyn Write,
        on_file: &mut dyn FnMut(&SnapshotFile),
        cancel: &CancellationToken,
    ) -> Result<(), ExportError>;

    /// The database name as a path segment.
    fn name_segment(&self) -> Result<PathSegment, ExportError> {
        PathSegment::try_from(self.name())
            .map_err(|e| ExportError::InvalidName(self.name().to_string(), e.to_string()))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to serialize an item: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Items of type {0:?} were already read from this session")]
    AlreadyConsumed(ItemType),

    #[error("Failed to open a read view: {0}")]
    OpenView(String),

    #[error("Failed to copy the storage: {0}")]
    Storage(String),

    #[error("'{0}' is not a valid name: {1}")]
    InvalidName(String, String),

    #[error("The artifact is malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error("The export was cancelled")]
    Cancelled,
}
