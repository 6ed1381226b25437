use core::{iter, mem};
use std::collections::HashSet;

use shared::CancellationToken;

use super::{
    DocumentDatabase, ExportError, ExportItem, IndexDefinition, Item, ItemIter, ItemType,
    StorageView, Watermarks, coalesce_indexes,
};

/// What a session includes besides the changed items.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Include document and compare exchange tombstones. Full exports leave them out.
    pub include_tombstones: bool,
}

/// Opens export sessions on a database.
pub struct ExportSource<'a> {
    database: &'a dyn DocumentDatabase,
}

impl<'a> ExportSource<'a> {
    /// A source reading `database`.
    pub fn new(database: &'a dyn DocumentDatabase) -> Self {
        Self { database }
    }

    /// Open a session over a consistent view.
    ///
    /// `start` holds the first watermarks to include, one past what the
    /// previous backup captured, or zero for a full export.
    pub fn open(
        &self,
        start: Watermarks,
        options: ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<ExportSession<'a>, ExportError> {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let view = self.database.open_view()?;
        let indexes = coalesce_indexes(self.database.index_definitions());

        Ok(ExportSession {
            view,
            indexes,
            start,
            options,
            position: 0,
            consumed: HashSet::new(),
        })
    }
}

/// One pass over a point in time view of the database.
///
/// Each item type can be read once, a second read needs a new session.
pub struct ExportSession<'a> {
    view: Box<dyn StorageView + 'a>,
    indexes: Vec<IndexDefinition>,
    start: Watermarks,
    options: ExportOptions,
    position: usize,
    consumed: HashSet<ItemType>,
}

impl ExportSession<'_> {
    /// The watermarks of the view, fixed when the session was opened.
    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            document: self.view.document_watermark(),
            cluster: self.view.cluster_watermark(),
        }
    }

    /// The first watermarks the session includes.
    pub fn start(&self) -> Watermarks {
        self.start
    }

    /// The next item type in export order, `End` once every type was returned.
    pub fn next_item_type(&mut self) -> ItemType {
        let item_type = ItemType::ORDER
            .get(self.position)
            .copied()
            .unwrap_or(ItemType::End);

        if item_type != ItemType::End {
            self.position += 1;
        }

        item_type
    }

    /// The items of one type, ascending by watermark.
    pub fn items(&mut self, item_type: ItemType) -> Result<ItemIter<'_, ExportItem>, ExportError> {
        if !self.consumed.insert(item_type) {
            return Err(ExportError::AlreadyConsumed(item_type));
        }

        let indexes = if item_type == ItemType::Indexes {
            mem::take(&mut self.indexes)
        } else {
            Vec::new()
        };

        let view = &*self.view;
        let document = self.start.document;
        let cluster = self.start.cluster;
        let include_tombstones = self.options.include_tombstones;
        let view_cluster = view.cluster_watermark();

        let items: ItemIter<'_, ExportItem> = match item_type {
            ItemType::DatabaseRecord => {
                let mut record = view.database_record();
                record
                    .periodic_backups
                    .retain(|definition| !definition.is_server_wide());

                Box::new(iter::once(ExportItem {
                    watermark: view_cluster,
                    item: Item::DatabaseRecord(record),
                }))
            }

            ItemType::Documents => Box::new(
                view.documents(document)
                    .filter(move |item| item.etag >= document)
                    .map(|item| ExportItem {
                        watermark: item.etag,
                        item: Item::Document(item),
                    }),
            ),

            ItemType::Revisions if view.revisions_configured() => Box::new(
                view.revisions(document)
                    .filter(move |item| item.etag >= document)
                    .map(|item| ExportItem {
                        watermark: item.etag,
                        item: Item::Revision(item),
                    }),
            ),

            ItemType::Tombstones if include_tombstones => Box::new(
                view.tombstones(document)
                    .filter(move |item| item.etag >= document)
                    .map(|item| ExportItem {
                        watermark: item.etag,
                        item: Item::Tombstone(item),
                    }),
            ),

            ItemType::Conflicts => Box::new(
                view.conflicts(document)
                    .filter(move |item| item.etag >= document)
                    .map(|item| ExportItem {
                        watermark: item.etag,
                        item: Item::Conflict(item),
                    }),
            ),

            ItemType::Indexes => Box::new(indexes.into_iter().map(move |item| ExportItem {
                watermark: view_cluster,
                item: Item::Index(item),
            })),

            ItemType::Identities => Box::new(
                view.identities(cluster)
                    .filter(move |item| item.index >= cluster)
                    .map(|item| ExportItem {
                        watermark: item.index,
                        item: Item::Identity(item),
                    }),
            ),

            ItemType::CompareExchange => Box::new(
                view.compare_exchange(cluster)
                    .filter(move |item| item.index >= cluster)
                    .map(|item| ExportItem {
                        watermark: item.index,
                        item: Item::CompareExchange(item),
                    }),
            ),

            ItemType::CompareExchangeTombstones if include_tombstones => Box::new(
                view.compare_exchange_tombstones(cluster)
                    .filter(move |item| item.index >= cluster)
                    .map(|item| ExportItem {
                        watermark: item.index,
                        item: Item::CompareExchangeTombstone(item),
                    }),
            ),

            ItemType::Counters => Box::new(
                view.counters(document)
                    .filter(move |item| item.etag >= document)
                    .map(|item| ExportItem {
                        watermark: item.etag,
                        item: Item::Counters(item),
                    }),
            ),

            ItemType::Subscriptions => Box::new(
                view.subscriptions(cluster)
                    .filter(move |item| item.index >= cluster)
                    .map(|item| ExportItem {
                        watermark: item.index,
                        item: Item::Subscription(item),
                    }),
            ),

            ItemType::Revisions
            | ItemType::Tombstones
            | ItemType::CompareExchangeTombstones
            | ItemType::End => Box::new(iter::empty()),
        };

        Ok(items)
    }
}
