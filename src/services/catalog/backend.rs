use crate::error::RemoteError;
use crate::model::acl::AccessLevel;
use crate::model::object::{ObjectKind, Replica};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// What a backend needs to open an authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Credentials for a local or in-process catalog
    pub fn new(username: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1247,
            zone: zone.into(),
            username: username.into(),
            password: String::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }
}

/// Opaque authenticated channel to the catalog
///
/// Only a backend creates these; callers borrow them from the session pool.
#[derive(Debug, PartialEq, Eq)]
pub struct Session {
    id: u64,
    username: String,
    zone: String,
}

impl Session {
    pub fn new(id: u64, username: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            zone: zone.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }
}

/// Offset/limit requested from one entry stream; `None` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryWindow {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl QueryWindow {
    pub const UNBOUNDED: QueryWindow = QueryWindow {
        offset: None,
        limit: None,
    };

    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset: Some(offset),
            limit: Some(limit),
        }
    }
}

/// The remote side produces a collection's children as separate streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStream {
    /// Sub-collections only
    SubCollections,
    /// Data objects only (one row per replica when replicas are not trimmed)
    DataObjects,
    /// Sub-collections followed by data objects, used for unpaginated reads
    Combined,
}

/// Read position within one entry stream of an open collection
///
/// A backend calls `begin` the first time a stream is read and then hands
/// out row indices with `next_index` until it returns `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCursor {
    started: bool,
    total_rows: usize,
    start: usize,
    next: usize,
    end: usize,
}

impl StreamCursor {
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Position the cursor on a stream of `total_rows` rows
    pub fn begin(&mut self, total_rows: usize, window: QueryWindow) {
        let start = window.offset.unwrap_or(0).min(total_rows);
        let end = match window.limit {
            Some(limit) => start.saturating_add(limit).min(total_rows),
            None => total_rows,
        };
        *self = Self {
            started: true,
            total_rows,
            start,
            next: start,
            end,
        };
    }

    /// Index of the next row to return, or `None` once the window is drained
    pub fn next_index(&mut self) -> Option<usize> {
        if !self.started || self.next >= self.end {
            return None;
        }
        let idx = self.next;
        self.next += 1;
        Some(idx)
    }

    /// Rows the stream holds remotely, regardless of the window
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Rows the window selects
    pub fn row_count(&self) -> usize {
        self.end - self.start
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Per-stream totals reported when the combined stream begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamTotals {
    pub collections: usize,
    pub data_objects: usize,
}

/// Remote read handle for one open collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionHandle {
    id: u64,
    path: String,
    trim_replicas: bool,
    sub_collections: StreamCursor,
    data_objects: StreamCursor,
    combined: StreamCursor,
    stream_totals: Option<StreamTotals>,
}

impl CollectionHandle {
    pub fn new(id: u64, path: impl Into<String>, trim_replicas: bool) -> Self {
        Self {
            id,
            path: path.into(),
            trim_replicas,
            sub_collections: StreamCursor::default(),
            data_objects: StreamCursor::default(),
            combined: StreamCursor::default(),
            stream_totals: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn trim_replicas(&self) -> bool {
        self.trim_replicas
    }

    pub fn cursor(&self, stream: EntryStream) -> &StreamCursor {
        match stream {
            EntryStream::SubCollections => &self.sub_collections,
            EntryStream::DataObjects => &self.data_objects,
            EntryStream::Combined => &self.combined,
        }
    }

    pub fn cursor_mut(&mut self, stream: EntryStream) -> &mut StreamCursor {
        match stream {
            EntryStream::SubCollections => &mut self.sub_collections,
            EntryStream::DataObjects => &mut self.data_objects,
            EntryStream::Combined => &mut self.combined,
        }
    }

    pub fn stream_totals(&self) -> Option<StreamTotals> {
        self.stream_totals
    }

    pub fn set_stream_totals(&mut self, totals: StreamTotals) {
        self.stream_totals = Some(totals);
    }

    /// Forget every stream position so the handle can be read again
    pub fn rewind(&mut self) {
        self.sub_collections.clear();
        self.data_objects.clear();
        self.combined.clear();
        self.stream_totals = None;
    }
}

/// One row of a collection listing
#[derive(Debug, Clone, PartialEq)]
pub struct CollEntry {
    /// `Collection` or `DataObject`
    pub kind: ObjectKind,
    pub path: String,
    pub owner_name: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
    pub data_id: String,
    pub replica: Option<Replica>,
}

/// Result of a stat call
#[derive(Debug, Clone, PartialEq)]
pub struct ObjStat {
    pub kind: ObjectKind,
    pub size: u64,
    pub mode: u32,
    pub data_id: String,
    pub checksum: String,
    pub owner_name: String,
    pub owner_zone: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

/// Permission row as the catalog reports it, before resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAcl {
    pub name: String,
    pub subject_kind: String,
    pub access: String,
    pub zone: String,
}

/// Attribute-value-unit metadata triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avu {
    pub attribute: String,
    pub value: String,
    #[serde(default)]
    pub units: String,
}

impl Avu {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>, units: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
            units: units.into(),
        }
    }
}

impl fmt::Display for Avu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.attribute, self.value)?;
        if !self.units.is_empty() {
            write!(f, " {}", self.units)?;
        }
        Ok(())
    }
}

/// Whether a move renames a collection or a data object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Collection,
    DataObject,
}

/// Flags for `remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOptions {
    pub recursive: bool,
    /// Delete outright instead of moving to the trash
    pub force: bool,
    /// Operate on an entry that is already in the trash
    pub in_trash: bool,
}

/// Flags for `trim_replicas`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrimOptions {
    /// Only trim replicas on this resource
    pub resource: Option<String>,
    /// Keep at least this many copies
    pub min_copies: u32,
    /// Only trim replicas older than this many minutes
    pub min_age_minutes: u32,
}

/// Async catalog backend trait
///
/// This trait is the whole remote surface the client model consumes. Every
/// call is made on a session borrowed from the pool; a non-zero remote
/// status comes back as `RemoteError`.
#[async_trait]
pub trait CatalogBackend: Send + Sync {
    /// Open an authenticated session
    async fn connect(&self, credentials: &Credentials) -> Result<Session, RemoteError>;

    async fn disconnect(&self, session: Session) -> Result<(), RemoteError>;

    /// Open a collection for reading
    ///
    /// With `trim_replicas == false` the data object stream yields one row
    /// per replica.
    async fn open_collection(
        &self,
        session: &Session,
        path: &str,
        trim_replicas: bool,
    ) -> Result<CollectionHandle, RemoteError>;

    /// Next row of `stream`, or `None` once the window is drained
    ///
    /// The window is applied the first time a stream is read on a handle and
    /// ignored afterwards.
    async fn read_collection_entry(
        &self,
        session: &Session,
        handle: &mut CollectionHandle,
        stream: EntryStream,
        window: QueryWindow,
    ) -> Result<Option<CollEntry>, RemoteError>;

    async fn close_collection(
        &self,
        session: &Session,
        handle: CollectionHandle,
    ) -> Result<(), RemoteError>;

    async fn stat_object(&self, session: &Session, path: &str) -> Result<ObjStat, RemoteError>;

    async fn get_acl(
        &self,
        session: &Session,
        path: &str,
        zone_hint: &str,
    ) -> Result<Vec<RawAcl>, RemoteError>;

    async fn chmod(
        &self,
        session: &Session,
        path: &str,
        subject: &str,
        zone: &str,
        level: AccessLevel,
        recursive: bool,
    ) -> Result<(), RemoteError>;

    async fn get_inheritance(&self, session: &Session, path: &str) -> Result<bool, RemoteError>;

    async fn set_inheritance(
        &self,
        session: &Session,
        path: &str,
        inherit: bool,
        recursive: bool,
    ) -> Result<(), RemoteError>;

    async fn remove(
        &self,
        session: &Session,
        path: &str,
        options: RemoveOptions,
    ) -> Result<(), RemoteError>;

    async fn move_object(
        &self,
        session: &Session,
        src: &str,
        dst: &str,
        kind: MoveKind,
    ) -> Result<(), RemoteError>;

    async fn create_collection(&self, session: &Session, path: &str) -> Result<(), RemoteError>;

    async fn copy_data_object(
        &self,
        session: &Session,
        src: &str,
        dst: &str,
    ) -> Result<(), RemoteError>;

    async fn trim_replicas(
        &self,
        session: &Session,
        path: &str,
        options: &TrimOptions,
    ) -> Result<(), RemoteError>;

    /// Make a copy on `resource`; with `backup` an existing up-to-date copy is not an error
    async fn replicate(
        &self,
        session: &Session,
        path: &str,
        resource: &str,
        backup: bool,
    ) -> Result<(), RemoteError>;

    async fn move_to_resource(
        &self,
        session: &Session,
        path: &str,
        resource: &str,
    ) -> Result<(), RemoteError>;

    async fn list_users(&self, session: &Session) -> Result<Vec<String>, RemoteError>;

    async fn list_groups(&self, session: &Session) -> Result<Vec<String>, RemoteError>;

    /// Key/value description of a user or group (`user_id`, `zone_name`, ...)
    async fn get_user_info(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<HashMap<String, String>, RemoteError>;

    /// Members of a group as `name#zone`
    async fn get_group_members(
        &self,
        session: &Session,
        group: &str,
    ) -> Result<Vec<String>, RemoteError>;

    async fn add_user_to_group(
        &self,
        session: &Session,
        user: &str,
        zone: &str,
        group: &str,
    ) -> Result<(), RemoteError>;

    async fn list_metadata(
        &self,
        session: &Session,
        path: &str,
        kind: ObjectKind,
    ) -> Result<Vec<Avu>, RemoteError>;

    async fn add_metadata(
        &self,
        session: &Session,
        path: &str,
        kind: ObjectKind,
        avu: &Avu,
    ) -> Result<(), RemoteError>;

    async fn remove_metadata(
        &self,
        session: &Session,
        path: &str,
        kind: ObjectKind,
        avu: &Avu,
    ) -> Result<(), RemoteError>;
}
