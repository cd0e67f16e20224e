//! Paged reads of a collection's children
//!
//! The catalog produces a collection's children as two independently
//! counted streams: sub-collections first, then data objects. Callers see a
//! single listing in that order and page through it with one global offset
//! and limit. `read_window` translates the global window into one window
//! per stream; `read_full` drains the combined stream and supports a
//! filter.

use crate::error::{CatalogError, CatalogResult};
use crate::model::object::ObjectKind;
use crate::services::catalog::backend::{
    CollEntry, CollectionHandle, EntryStream, QueryWindow, StreamTotals,
};
use crate::services::catalog::pool::{PooledSession, SessionPool};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Predicate deciding whether a row is kept by a full read
///
/// The reader gives its session back to the pool before calling the filter,
/// so a filter may make catalog calls of its own.
#[async_trait]
pub trait ReadFilter: Send + Sync {
    async fn accept(&self, entry: &CollEntry) -> bool;
}

#[async_trait]
impl<F> ReadFilter for F
where
    F: Fn(&CollEntry) -> bool + Send + Sync,
{
    async fn accept(&self, entry: &CollEntry) -> bool {
        self(entry)
    }
}

/// Options for a full read; `None` offset and limit mean unbounded
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub filter: Option<Arc<dyn ReadFilter>>,
}

impl ReadOptions {
    pub fn with_filter(mut self, filter: impl ReadFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("filter", &self.filter.as_ref().map(|_| "<dyn ReadFilter>"))
            .finish()
    }
}

/// Global window over sub-collections followed by data objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadWindow {
    pub offset: usize,
    /// `None` reads to the end of both streams
    pub limit: Option<usize>,
}

impl ReadWindow {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// Row counts of one read, per stream and combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadInfo {
    /// Sub-collection rows returned
    pub col_count: usize,
    /// Data object rows returned
    pub obj_count: usize,
    pub result_total: usize,
    /// Sub-collections held remotely
    pub col_total: usize,
    /// Data object rows held remotely
    pub obj_total: usize,
    pub total: usize,
}

impl ReadInfo {
    pub fn new(col_count: usize, obj_count: usize, col_total: usize, obj_total: usize) -> Self {
        Self {
            col_count,
            obj_count,
            result_total: col_count + obj_count,
            col_total,
            obj_total,
            total: col_total + obj_total,
        }
    }
}

impl fmt::Display for ReadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} ({} of {} collections, {} of {} data objects)",
            self.result_total,
            self.total,
            self.col_count,
            self.col_total,
            self.obj_count,
            self.obj_total
        )
    }
}

/// Rows of one read plus their counts
#[derive(Debug, Clone, Default)]
pub struct ReadPage {
    pub rows: Vec<CollEntry>,
    pub info: ReadInfo,
}

/// Drains an open collection handle through pooled sessions
pub struct PagedCollectionReader<'a> {
    pool: &'a SessionPool,
}

impl<'a> PagedCollectionReader<'a> {
    pub fn new(pool: &'a SessionPool) -> Self {
        Self { pool }
    }

    /// Read one global window, sub-collections first
    ///
    /// The object stream is skipped entirely when the sub-collection stream
    /// fills the window.
    pub async fn read_window(
        &self,
        handle: &mut CollectionHandle,
        window: ReadWindow,
    ) -> CatalogResult<ReadPage> {
        handle.rewind();
        let session = self.pool.acquire().await?;
        let mut rows = Vec::new();

        let col_query = QueryWindow {
            offset: Some(window.offset),
            limit: window.limit,
        };
        drain_stream(&session, handle, EntryStream::SubCollections, col_query, &mut rows).await?;
        let cursor = handle.cursor(EntryStream::SubCollections);
        let (col_total, col_count) = (cursor.total_rows(), cursor.row_count());

        let obj_limit = window.limit.map(|limit| limit.saturating_sub(col_count));
        if obj_limit == Some(0) {
            tracing::debug!(
                path = handle.path(),
                col_count,
                "window filled by sub-collections, skipping data objects"
            );
            return Ok(ReadPage {
                rows,
                info: ReadInfo::new(col_count, 0, col_total, 0),
            });
        }

        let obj_query = QueryWindow {
            offset: Some(window.offset.saturating_sub(col_total)),
            limit: obj_limit,
        };
        drain_stream(&session, handle, EntryStream::DataObjects, obj_query, &mut rows).await?;
        let cursor = handle.cursor(EntryStream::DataObjects);
        let info = ReadInfo::new(col_count, cursor.row_count(), col_total, cursor.total_rows());

        tracing::debug!(
            path = handle.path(),
            offset = window.offset,
            limit = ?window.limit,
            col_count = info.col_count,
            obj_count = info.obj_count,
            "read collection window"
        );
        Ok(ReadPage { rows, info })
    }

    /// Read the combined stream, applying the filter before offset and limit
    ///
    /// Rejected rows neither count toward the limit nor appear in the page.
    /// Stream totals are taken once, from the first row observed.
    pub async fn read_full(
        &self,
        handle: &mut CollectionHandle,
        options: &ReadOptions,
    ) -> CatalogResult<ReadPage> {
        handle.rewind();
        let mut session: Option<PooledSession<'_>> = Some(self.pool.acquire().await?);
        let mut totals: Option<StreamTotals> = None;
        let mut rows = Vec::new();
        let (mut col_count, mut obj_count, mut index) = (0, 0, 0);

        loop {
            let current = match session.take() {
                Some(current) => current,
                None => self.pool.acquire().await?,
            };
            let entry = current
                .backend()
                .read_collection_entry(
                    current.session(),
                    handle,
                    EntryStream::Combined,
                    QueryWindow::UNBOUNDED,
                )
                .await
                .map_err(|e| CatalogError::remote("read collection", handle.path(), e))?;
            session = Some(current);

            let Some(entry) = entry else { break };
            if totals.is_none() {
                totals = handle.stream_totals();
            }
            if options.limit.is_some_and(|limit| rows.len() == limit) {
                break;
            }

            if let Some(filter) = &options.filter {
                drop(session.take());
                if !filter.accept(&entry).await {
                    continue;
                }
            }

            if options.offset.is_some_and(|offset| index < offset) {
                index += 1;
                continue;
            }

            if entry.kind == ObjectKind::Collection {
                col_count += 1;
            } else {
                obj_count += 1;
            }
            rows.push(entry);
            index += 1;
        }

        let totals = totals.or_else(|| handle.stream_totals()).unwrap_or_default();
        let info = ReadInfo::new(col_count, obj_count, totals.collections, totals.data_objects);
        tracing::debug!(
            path = handle.path(),
            col_count,
            obj_count,
            filtered = options.filter.is_some(),
            "read collection"
        );
        Ok(ReadPage { rows, info })
    }
}

async fn drain_stream(
    session: &PooledSession<'_>,
    handle: &mut CollectionHandle,
    stream: EntryStream,
    window: QueryWindow,
    rows: &mut Vec<CollEntry>,
) -> CatalogResult<()> {
    while let Some(entry) = session
        .backend()
        .read_collection_entry(session.session(), handle, stream, window)
        .await
        .map_err(|e| CatalogError::remote("read collection", handle.path(), e))?
    {
        rows.push(entry);
    }
    Ok(())
}
