//! In-process catalog
//!
//! `MemoryCatalog` keeps a whole zone in a `BTreeMap` keyed by absolute
//! path, so listings come back in path order just like a real catalog
//! query sorted by name. It enforces the structural rules a client can
//! observe (parents must exist, names must be free, non-empty collections
//! need a recursive remove) but not permissions.

use super::backend::{
    Avu, CatalogBackend, CollEntry, CollectionHandle, Credentials, EntryStream, MoveKind, ObjStat,
    QueryWindow, RawAcl, RemoveOptions, Session, StreamTotals, TrimOptions,
};
use crate::error::RemoteError;
use crate::model::acl::AccessLevel;
use crate::model::object::{base_name, join_path, parent_path, ObjectKind, Replica};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const USER_FILE_DOES_NOT_EXIST: i32 = -310000;
pub const SYS_COPY_ALREADY_IN_RESC: i32 = -46000;
pub const SYS_RESC_DOES_NOT_EXIST: i32 = -78000;
pub const SYS_BAD_FILE_DESCRIPTOR: i32 = -345000;
pub const CAT_NO_ROWS_FOUND: i32 = -808000;
pub const CAT_NAME_EXISTS: i32 = -809000;
pub const CAT_INVALID_USER: i32 = -818000;
pub const CAT_COLLECTION_NOT_EMPTY: i32 = -821000;
pub const CAT_NOT_A_COLLECTION: i32 = -825000;

/// Resource every catalog starts with
pub const DEFAULT_RESOURCE: &str = "demoResc";

/// Administrator every catalog starts with
pub const ADMIN_USER: &str = "rods";

#[derive(Debug, Clone)]
struct Entry {
    kind: ObjectKind,
    owner: String,
    create_time: DateTime<Utc>,
    modify_time: DateTime<Utc>,
    size: u64,
    checksum: String,
    data_id: String,
    replicas: Vec<Replica>,
    acl: BTreeMap<String, AccessLevel>,
    /// Rows whose access string has no `AccessLevel` counterpart
    raw_acl: Vec<(String, String)>,
    inherit: bool,
    meta: Vec<Avu>,
}

impl Entry {
    fn is_collection(&self) -> bool {
        self.kind == ObjectKind::Collection
    }
}

#[derive(Debug, Clone)]
struct Principal {
    kind: ObjectKind,
    id: i64,
    comment: String,
    info: String,
    create_time: DateTime<Utc>,
    members: Vec<String>,
}

#[derive(Debug)]
struct State {
    zone: String,
    entries: BTreeMap<String, Entry>,
    principals: BTreeMap<String, Principal>,
    resources: Vec<String>,
    open_handles: HashMap<u64, String>,
    sessions: usize,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry(&self, path: &str) -> Result<&Entry, RemoteError> {
        self.entries
            .get(path)
            .ok_or_else(|| not_found(path))
    }

    fn entry_mut(&mut self, path: &str) -> Result<&mut Entry, RemoteError> {
        self.entries
            .get_mut(path)
            .ok_or_else(|| not_found(path))
    }

    fn collection(&self, path: &str) -> Result<&Entry, RemoteError> {
        let entry = self.entry(path)?;
        if !entry.is_collection() {
            return Err(RemoteError::new(
                CAT_NOT_A_COLLECTION,
                format!("{path} is not a collection"),
            ));
        }
        Ok(entry)
    }

    fn children(&self, path: &str, kind: ObjectKind) -> Vec<(&String, &Entry)> {
        self.entries
            .range(format!("{}/", path.trim_end_matches('/'))..)
            .take_while(|(k, _)| is_below(k, path))
            .filter(|(k, e)| e.kind == kind && parent_path(k) == path)
            .collect()
    }

    /// `path` itself followed by everything below it
    fn subtree_keys(&self, path: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .get_key_value(path)
            .map(|(k, _)| k.clone())
            .into_iter()
            .collect();
        keys.extend(
            self.entries
                .range(format!("{}/", path.trim_end_matches('/'))..)
                .take_while(|(k, _)| is_below(k, path))
                .map(|(k, _)| k.clone()),
        );
        keys
    }

    fn new_entry(&mut self, kind: ObjectKind, owner: &str) -> Entry {
        let now = Utc::now();
        let data_id = if kind == ObjectKind::DataObject {
            self.next_id().to_string()
        } else {
            String::new()
        };
        Entry {
            kind,
            owner: owner.to_string(),
            create_time: now,
            modify_time: now,
            size: 0,
            checksum: String::new(),
            data_id,
            replicas: Vec::new(),
            acl: BTreeMap::from([(owner.to_string(), AccessLevel::Own)]),
            raw_acl: Vec::new(),
            inherit: false,
            meta: Vec::new(),
        }
    }

    /// Create `path` and any missing parents as collections
    fn ensure_collection(&mut self, path: &str, owner: &str) {
        let path = path.trim_end_matches('/');
        if path.is_empty() || self.entries.contains_key(path) {
            return;
        }
        let parent = parent_path(path);
        if parent != "/" {
            self.ensure_collection(parent, owner);
        }
        let entry = self.new_entry(ObjectKind::Collection, owner);
        self.entries.insert(path.to_string(), entry);
    }

    fn check_free(&self, path: &str) -> Result<(), RemoteError> {
        if self.entries.contains_key(path) {
            return Err(RemoteError::new(
                CAT_NAME_EXISTS,
                format!("{path} already exists"),
            ));
        }
        self.collection(parent_path(path)).map(|_| ())
    }

    fn check_resource(&self, resource: &str) -> Result<(), RemoteError> {
        if self.resources.iter().any(|r| r == resource) {
            Ok(())
        } else {
            Err(RemoteError::new(
                SYS_RESC_DOES_NOT_EXIST,
                format!("resource {resource} does not exist"),
            ))
        }
    }

    fn principal(&self, name: &str) -> Result<&Principal, RemoteError> {
        self.principals
            .get(name)
            .ok_or_else(|| RemoteError::new(CAT_INVALID_USER, format!("no such user or group {name}")))
    }

    /// Move every key under `src` to the same place under `dst`
    fn rebase(&mut self, src: &str, dst: &str) {
        for key in self.subtree_keys(src) {
            if let Some(entry) = self.entries.remove(&key) {
                let new_key = format!("{dst}{}", &key[src.len()..]);
                self.entries.insert(new_key, entry);
            }
        }
    }

    /// Data object paths at or below `path`
    fn data_objects_under(&self, path: &str) -> Vec<String> {
        self.subtree_keys(path)
            .into_iter()
            .filter(|k| self.entries.get(k).is_some_and(|e| !e.is_collection()))
            .collect()
    }

    fn listing(&self, path: &str, stream: EntryStream, trim_replicas: bool) -> Vec<CollEntry> {
        let collections = || {
            self.children(path, ObjectKind::Collection)
                .into_iter()
                .map(|(k, e)| row(k, e, None))
        };
        let objects = || {
            self.children(path, ObjectKind::DataObject)
                .into_iter()
                .flat_map(move |(k, e)| {
                    if trim_replicas || e.replicas.is_empty() {
                        vec![row(k, e, None)]
                    } else {
                        e.replicas
                            .iter()
                            .map(|r| row(k, e, Some(r.clone())))
                            .collect()
                    }
                })
        };
        match stream {
            EntryStream::SubCollections => collections().collect(),
            EntryStream::DataObjects => objects().collect(),
            EntryStream::Combined => collections().chain(objects()).collect(),
        }
    }
}

fn is_below(key: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    key.len() > path.len() + 1 && key.starts_with(path) && key.as_bytes()[path.len()] == b'/'
}

fn not_found(path: &str) -> RemoteError {
    RemoteError::new(USER_FILE_DOES_NOT_EXIST, format!("{path} does not exist"))
}

fn row(path: &str, entry: &Entry, replica: Option<Replica>) -> CollEntry {
    CollEntry {
        kind: entry.kind,
        path: path.to_string(),
        owner_name: entry.owner.clone(),
        create_time: entry.create_time,
        modify_time: entry.modify_time,
        size: entry.size,
        checksum: entry.checksum.clone(),
        data_id: entry.data_id.clone(),
        replica,
    }
}

/// Access string as the catalog lists it
fn listing_access(level: AccessLevel) -> &'static str {
    match level {
        AccessLevel::Own => "own",
        AccessLevel::Write => "modify object",
        AccessLevel::Read => "read object",
        AccessLevel::Null => "null",
    }
}

/// Serializable description of a catalog, loaded by the `rods-ls` binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub zone: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub users: Vec<SnapshotUser>,
    #[serde(default)]
    pub groups: Vec<SnapshotGroup>,
    #[serde(default)]
    pub collections: Vec<SnapshotCollection>,
    #[serde(default)]
    pub data_objects: Vec<SnapshotDataObject>,
    #[serde(default)]
    pub acls: Vec<SnapshotAcl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotUser {
    pub name: String,
    /// Subject kind (`rodsuser`, `rodsadmin`, `groupadmin`)
    #[serde(default = "default_user_kind")]
    pub kind: String,
}

fn default_user_kind() -> String {
    "rodsuser".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotGroup {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCollection {
    pub path: String,
    #[serde(default = "default_owner")]
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDataObject {
    pub path: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub size: u64,
    /// Extra resources holding a replica besides the default one
    #[serde(default)]
    pub replicas: Vec<String>,
}

fn default_owner() -> String {
    ADMIN_USER.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAcl {
    pub path: String,
    pub subject: String,
    pub access: AccessLevel,
}

/// Catalog held entirely in memory
#[derive(Debug)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    /// Empty zone with `/zone/home`, `/zone/trash/home`, the `rods`
    /// administrator and one default resource
    pub fn new(zone: &str) -> Self {
        let now = Utc::now();
        let mut state = State {
            zone: zone.to_string(),
            entries: BTreeMap::new(),
            principals: BTreeMap::new(),
            resources: vec![DEFAULT_RESOURCE.to_string()],
            open_handles: HashMap::new(),
            sessions: 0,
            next_id: 10000,
        };
        state.principals.insert(
            ADMIN_USER.to_string(),
            Principal {
                kind: ObjectKind::Admin,
                id: 10000,
                comment: String::new(),
                info: String::new(),
                create_time: now,
                members: Vec::new(),
            },
        );
        state.ensure_collection(&format!("/{zone}/home"), ADMIN_USER);
        state.ensure_collection(&format!("/{zone}/trash/home"), ADMIN_USER);

        Self {
            state: Mutex::new(state),
        }
    }

    /// Build a catalog from a snapshot
    pub fn from_snapshot(snapshot: &CatalogSnapshot) -> Result<Self, RemoteError> {
        let catalog = Self::new(&snapshot.zone);
        for resource in &snapshot.resources {
            catalog.add_resource(resource);
        }
        for user in &snapshot.users {
            let kind = ObjectKind::from_subject_kind(&user.kind)
                .map_err(|e| RemoteError::new(CAT_INVALID_USER, e.to_string()))?;
            catalog.add_user(&user.name, kind);
        }
        for group in &snapshot.groups {
            let members: Vec<&str> = group.members.iter().map(String::as_str).collect();
            catalog.add_group(&group.name, &members);
        }
        for collection in &snapshot.collections {
            catalog.add_collection(&collection.path, &collection.owner);
        }
        for object in &snapshot.data_objects {
            catalog.add_data_object(&object.path, &object.owner, object.size);
            for resource in &object.replicas {
                catalog.add_resource(resource);
                catalog.add_replica(&object.path, resource);
            }
        }
        for acl in &snapshot.acls {
            catalog.grant(&acl.path, &acl.subject, acl.access);
        }
        Ok(catalog)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn zone(&self) -> String {
        self.lock().zone.clone()
    }

    pub fn add_resource(&self, name: &str) -> &Self {
        let mut state = self.lock();
        if !state.resources.iter().any(|r| r == name) {
            state.resources.push(name.to_string());
        }
        self
    }

    pub fn add_user(&self, name: &str, kind: ObjectKind) -> &Self {
        let mut state = self.lock();
        let id = state.next_id() as i64;
        state.principals.insert(
            name.to_string(),
            Principal {
                kind,
                id,
                comment: String::new(),
                info: String::new(),
                create_time: Utc::now(),
                members: Vec::new(),
            },
        );
        let home = format!("/{}/home/{name}", state.zone);
        state.ensure_collection(&home, name);
        self
    }

    pub fn add_group(&self, name: &str, members: &[&str]) -> &Self {
        let mut state = self.lock();
        let id = state.next_id() as i64;
        state.principals.insert(
            name.to_string(),
            Principal {
                kind: ObjectKind::Group,
                id,
                comment: String::new(),
                info: String::new(),
                create_time: Utc::now(),
                members: members.iter().map(|m| m.to_string()).collect(),
            },
        );
        self
    }

    /// Add a collection and any missing parents
    pub fn add_collection(&self, path: &str, owner: &str) -> &Self {
        self.lock().ensure_collection(path, owner);
        self
    }

    /// Add a data object with one replica on the default resource
    pub fn add_data_object(&self, path: &str, owner: &str, size: u64) -> &Self {
        let mut state = self.lock();
        state.ensure_collection(parent_path(path), owner);
        let mut entry = state.new_entry(ObjectKind::DataObject, owner);
        entry.size = size;
        entry.checksum = format!("sha2:{:016x}", size.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        entry.replicas.push(Replica {
            number: 0,
            resource: DEFAULT_RESOURCE.to_string(),
        });
        state.entries.insert(path.to_string(), entry);
        self
    }

    pub fn add_replica(&self, path: &str, resource: &str) -> &Self {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(path) {
            let number = entry.replicas.iter().map(|r| r.number + 1).max().unwrap_or(0);
            entry.replicas.push(Replica {
                number,
                resource: resource.to_string(),
            });
        }
        self
    }

    pub fn grant(&self, path: &str, subject: &str, level: AccessLevel) -> &Self {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(path) {
            entry.acl.insert(subject.to_string(), level);
        }
        self
    }

    /// Record an ACL row with an access string the client may not understand
    pub fn grant_raw(&self, path: &str, subject: &str, access: &str) -> &Self {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(path) {
            entry.raw_acl.push((subject.to_string(), access.to_string()));
        }
        self
    }

    /// Forget a user or group without telling connected clients
    pub fn remove_principal(&self, name: &str) -> &Self {
        self.lock().principals.remove(name);
        self
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().entries.contains_key(path)
    }

    pub fn is_collection(&self, path: &str) -> bool {
        self.lock().entries.get(path).is_some_and(Entry::is_collection)
    }

    /// Child paths of a collection, sub-collections first
    pub fn list(&self, path: &str) -> Vec<String> {
        self.lock()
            .listing(path, EntryStream::Combined, true)
            .into_iter()
            .map(|e| e.path)
            .collect()
    }

    pub fn replicas(&self, path: &str) -> Vec<Replica> {
        self.lock()
            .entries
            .get(path)
            .map(|e| e.replicas.clone())
            .unwrap_or_default()
    }

    /// Read handles opened and not yet closed
    pub fn open_handle_count(&self) -> usize {
        self.lock().open_handles.len()
    }

    /// Sessions connected and not yet disconnected
    pub fn session_count(&self) -> usize {
        self.lock().sessions
    }
}

#[async_trait]
impl CatalogBackend for MemoryCatalog {
    async fn connect(&self, credentials: &Credentials) -> Result<Session, RemoteError> {
        let mut state = self.lock();
        if credentials.zone != state.zone {
            return Err(RemoteError::new(
                CAT_INVALID_USER,
                format!("unknown zone {}", credentials.zone),
            ));
        }
        match state.principals.get(&credentials.username) {
            Some(p) if p.kind.is_user_like() => {}
            _ => {
                return Err(RemoteError::new(
                    CAT_INVALID_USER,
                    format!("unknown user {}", credentials.username),
                ))
            }
        }
        state.sessions += 1;
        let id = state.next_id();
        Ok(Session::new(id, &credentials.username, &credentials.zone))
    }

    async fn disconnect(&self, _session: Session) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.sessions = state.sessions.saturating_sub(1);
        Ok(())
    }

    async fn open_collection(
        &self,
        _session: &Session,
        path: &str,
        trim_replicas: bool,
    ) -> Result<CollectionHandle, RemoteError> {
        let mut state = self.lock();
        state.collection(path)?;
        let id = state.next_id();
        state.open_handles.insert(id, path.to_string());
        Ok(CollectionHandle::new(id, path, trim_replicas))
    }

    async fn read_collection_entry(
        &self,
        _session: &Session,
        handle: &mut CollectionHandle,
        stream: EntryStream,
        window: QueryWindow,
    ) -> Result<Option<CollEntry>, RemoteError> {
        let state = self.lock();
        if !state.open_handles.contains_key(&handle.id()) {
            return Err(RemoteError::new(
                SYS_BAD_FILE_DESCRIPTOR,
                format!("collection handle {} is not open", handle.id()),
            ));
        }

        let rows = state.listing(handle.path(), stream, handle.trim_replicas());
        if !handle.cursor(stream).is_started() {
            handle.cursor_mut(stream).begin(rows.len(), window);
            if stream == EntryStream::Combined {
                let collections = state
                    .children(handle.path(), ObjectKind::Collection)
                    .len();
                handle.set_stream_totals(StreamTotals {
                    collections,
                    data_objects: rows.len() - collections,
                });
            }
        }

        Ok(handle
            .cursor_mut(stream)
            .next_index()
            .and_then(|idx| rows.get(idx).cloned()))
    }

    async fn close_collection(
        &self,
        _session: &Session,
        handle: CollectionHandle,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        match state.open_handles.remove(&handle.id()) {
            Some(_) => Ok(()),
            None => Err(RemoteError::new(
                SYS_BAD_FILE_DESCRIPTOR,
                format!("collection handle {} is not open", handle.id()),
            )),
        }
    }

    async fn stat_object(&self, _session: &Session, path: &str) -> Result<ObjStat, RemoteError> {
        let state = self.lock();
        let entry = state.entry(path)?;
        Ok(ObjStat {
            kind: entry.kind,
            size: entry.size,
            mode: if entry.is_collection() { 0o755 } else { 0o644 },
            data_id: entry.data_id.clone(),
            checksum: entry.checksum.clone(),
            owner_name: entry.owner.clone(),
            owner_zone: state.zone.clone(),
            create_time: entry.create_time,
            modify_time: entry.modify_time,
        })
    }

    async fn get_acl(
        &self,
        _session: &Session,
        path: &str,
        zone_hint: &str,
    ) -> Result<Vec<RawAcl>, RemoteError> {
        let state = self.lock();
        let entry = state.entry(path)?;
        let subject_kind = |name: &str| {
            state
                .principals
                .get(name)
                .and_then(|p| p.kind.subject_kind())
                .unwrap_or("unknown")
                .to_string()
        };
        let rows = entry
            .acl
            .iter()
            .map(|(name, level)| (name.as_str(), listing_access(*level)))
            .chain(entry.raw_acl.iter().map(|(n, a)| (n.as_str(), a.as_str())));
        Ok(rows
            .map(|(name, access)| RawAcl {
                name: name.to_string(),
                subject_kind: subject_kind(name),
                access: access.to_string(),
                zone: zone_hint.to_string(),
            })
            .collect())
    }

    async fn chmod(
        &self,
        _session: &Session,
        path: &str,
        subject: &str,
        _zone: &str,
        level: AccessLevel,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.principal(subject)?;
        let keys = if recursive {
            state.subtree_keys(path)
        } else {
            state.entry(path)?;
            vec![path.to_string()]
        };
        if keys.is_empty() {
            return Err(not_found(path));
        }
        for key in keys {
            let entry = state.entry_mut(&key)?;
            if level == AccessLevel::Null {
                entry.acl.remove(subject);
            } else {
                entry.acl.insert(subject.to_string(), level);
            }
        }
        Ok(())
    }

    async fn get_inheritance(&self, _session: &Session, path: &str) -> Result<bool, RemoteError> {
        Ok(self.lock().collection(path)?.inherit)
    }

    async fn set_inheritance(
        &self,
        _session: &Session,
        path: &str,
        inherit: bool,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.collection(path)?;
        let keys = if recursive {
            state.subtree_keys(path)
        } else {
            vec![path.to_string()]
        };
        for key in keys {
            let entry = state.entry_mut(&key)?;
            if entry.is_collection() {
                entry.inherit = inherit;
            }
        }
        Ok(())
    }

    async fn remove(
        &self,
        session: &Session,
        path: &str,
        options: RemoveOptions,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let entry = state.entry(path)?;
        let keys = state.subtree_keys(path);
        if entry.is_collection() && keys.len() > 1 && !options.recursive {
            return Err(RemoteError::new(
                CAT_COLLECTION_NOT_EMPTY,
                format!("{path} is not empty"),
            ));
        }

        let trash_root = format!("/{}/trash", state.zone);
        if options.in_trash && !is_below(path, &trash_root) {
            return Err(not_found(path));
        }

        if options.force || options.in_trash {
            for key in keys {
                state.entries.remove(&key);
            }
            return Ok(());
        }

        let trash_dir = format!("{trash_root}/home/{}", session.username());
        state.ensure_collection(&trash_dir, session.username());
        let target = join_path(&trash_dir, base_name(path));
        for key in state.subtree_keys(&target) {
            state.entries.remove(&key);
        }
        state.rebase(path, &target);
        Ok(())
    }

    async fn move_object(
        &self,
        _session: &Session,
        src: &str,
        dst: &str,
        kind: MoveKind,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let entry = state.entry(src)?;
        let expected = match kind {
            MoveKind::Collection => ObjectKind::Collection,
            MoveKind::DataObject => ObjectKind::DataObject,
        };
        if entry.kind != expected {
            return Err(RemoteError::new(
                CAT_NOT_A_COLLECTION,
                format!("{src} is a {}, not a {expected}", entry.kind),
            ));
        }
        state.check_free(dst)?;
        state.rebase(src, dst);
        Ok(())
    }

    async fn create_collection(&self, session: &Session, path: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.check_free(path)?;
        let entry = state.new_entry(ObjectKind::Collection, session.username());
        state.entries.insert(path.to_string(), entry);
        Ok(())
    }

    async fn copy_data_object(
        &self,
        session: &Session,
        src: &str,
        dst: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let source = state.entry(src)?.clone();
        if source.is_collection() {
            return Err(RemoteError::new(
                CAT_NOT_A_COLLECTION,
                format!("{src} is a collection"),
            ));
        }
        state.check_free(dst)?;

        let mut copy = state.new_entry(ObjectKind::DataObject, session.username());
        copy.size = source.size;
        copy.checksum = source.checksum;
        copy.meta = source.meta;
        copy.replicas = source.replicas.into_iter().take(1).collect();
        for replica in &mut copy.replicas {
            replica.number = 0;
        }
        state.entries.insert(dst.to_string(), copy);
        Ok(())
    }

    async fn trim_replicas(
        &self,
        _session: &Session,
        path: &str,
        options: &TrimOptions,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.entry(path)?;
        let keep = options.min_copies.max(1) as usize;
        for key in state.data_objects_under(path) {
            let entry = state.entry_mut(&key)?;
            let mut idx = entry.replicas.len();
            while entry.replicas.len() > keep && idx > 0 {
                idx -= 1;
                let matches = options
                    .resource
                    .as_deref()
                    .map_or(true, |r| entry.replicas[idx].resource == r);
                if matches {
                    entry.replicas.remove(idx);
                }
            }
        }
        Ok(())
    }

    async fn replicate(
        &self,
        _session: &Session,
        path: &str,
        resource: &str,
        backup: bool,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.entry(path)?;
        state.check_resource(resource)?;
        for key in state.data_objects_under(path) {
            let entry = state.entry_mut(&key)?;
            if entry.replicas.iter().any(|r| r.resource == resource) {
                if backup {
                    continue;
                }
                return Err(RemoteError::new(
                    SYS_COPY_ALREADY_IN_RESC,
                    format!("{key} already has a replica on {resource}"),
                ));
            }
            let number = entry.replicas.iter().map(|r| r.number + 1).max().unwrap_or(0);
            entry.replicas.push(Replica {
                number,
                resource: resource.to_string(),
            });
        }
        Ok(())
    }

    async fn move_to_resource(
        &self,
        _session: &Session,
        path: &str,
        resource: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.entry(path)?;
        state.check_resource(resource)?;
        for key in state.data_objects_under(path) {
            let entry = state.entry_mut(&key)?;
            if entry.replicas.iter().any(|r| r.resource == resource) {
                return Err(RemoteError::new(
                    SYS_COPY_ALREADY_IN_RESC,
                    format!("{key} already has a replica on {resource}"),
                ));
            }
            if let Some(first) = entry.replicas.first_mut() {
                first.resource = resource.to_string();
            }
        }
        Ok(())
    }

    async fn list_users(&self, _session: &Session) -> Result<Vec<String>, RemoteError> {
        Ok(self
            .lock()
            .principals
            .iter()
            .filter(|(_, p)| p.kind != ObjectKind::Group)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_groups(&self, _session: &Session) -> Result<Vec<String>, RemoteError> {
        Ok(self
            .lock()
            .principals
            .iter()
            .filter(|(_, p)| p.kind == ObjectKind::Group)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_user_info(
        &self,
        _session: &Session,
        name: &str,
    ) -> Result<HashMap<String, String>, RemoteError> {
        let state = self.lock();
        let principal = state.principal(name)?;
        let ts = format!("{:011}", principal.create_time.timestamp());
        let kind = principal.kind.subject_kind().unwrap_or_default();
        Ok(HashMap::from([
            ("user_id".to_string(), principal.id.to_string()),
            ("user_name".to_string(), name.to_string()),
            ("user_type_name".to_string(), kind.to_string()),
            ("zone_name".to_string(), state.zone.clone()),
            ("user_info".to_string(), principal.info.clone()),
            ("r_comment".to_string(), principal.comment.clone()),
            ("create_ts".to_string(), ts.clone()),
            ("modify_ts".to_string(), ts),
        ]))
    }

    async fn get_group_members(
        &self,
        _session: &Session,
        group: &str,
    ) -> Result<Vec<String>, RemoteError> {
        let state = self.lock();
        let principal = state.principal(group)?;
        if principal.kind != ObjectKind::Group {
            return Err(RemoteError::new(
                CAT_INVALID_USER,
                format!("{group} is not a group"),
            ));
        }
        Ok(principal
            .members
            .iter()
            .map(|m| format!("{m}#{}", state.zone))
            .collect())
    }

    async fn add_user_to_group(
        &self,
        _session: &Session,
        user: &str,
        zone: &str,
        group: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if zone != state.zone || !state.principal(user)?.kind.is_user_like() {
            return Err(RemoteError::new(
                CAT_INVALID_USER,
                format!("unknown user {user}#{zone}"),
            ));
        }
        let principal = state
            .principals
            .get_mut(group)
            .filter(|p| p.kind == ObjectKind::Group)
            .ok_or_else(|| RemoteError::new(CAT_INVALID_USER, format!("unknown group {group}")))?;
        if principal.members.iter().any(|m| m == user) {
            return Err(RemoteError::new(
                CAT_NAME_EXISTS,
                format!("{user} is already a member of {group}"),
            ));
        }
        principal.members.push(user.to_string());
        Ok(())
    }

    async fn list_metadata(
        &self,
        _session: &Session,
        path: &str,
        _kind: ObjectKind,
    ) -> Result<Vec<Avu>, RemoteError> {
        Ok(self.lock().entry(path)?.meta.clone())
    }

    async fn add_metadata(
        &self,
        _session: &Session,
        path: &str,
        _kind: ObjectKind,
        avu: &Avu,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let entry = state.entry_mut(path)?;
        if entry.meta.contains(avu) {
            return Err(RemoteError::new(
                CAT_NAME_EXISTS,
                format!("{path} already has {avu}"),
            ));
        }
        entry.meta.push(avu.clone());
        Ok(())
    }

    async fn remove_metadata(
        &self,
        _session: &Session,
        path: &str,
        _kind: ObjectKind,
        avu: &Avu,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let entry = state.entry_mut(path)?;
        let before = entry.meta.len();
        entry.meta.retain(|a| a != avu);
        if entry.meta.len() == before {
            return Err(RemoteError::new(
                CAT_NO_ROWS_FOUND,
                format!("{path} has no {avu}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(catalog: &MemoryCatalog) -> Session {
        catalog
            .connect(&Credentials::new("rods", "tempZone"))
            .await
            .unwrap()
    }

    async fn drain(
        catalog: &MemoryCatalog,
        session: &Session,
        handle: &mut CollectionHandle,
        stream: EntryStream,
        window: QueryWindow,
    ) -> Vec<String> {
        let mut paths = Vec::new();
        while let Some(entry) = catalog
            .read_collection_entry(session, handle, stream, window)
            .await
            .unwrap()
        {
            paths.push(entry.path);
        }
        paths
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_user() {
        let catalog = MemoryCatalog::new("tempZone");
        let err = catalog
            .connect(&Credentials::new("mallory", "tempZone"))
            .await
            .unwrap_err();
        assert_eq!(err.status, CAT_INVALID_USER);
    }

    #[tokio::test]
    async fn test_streams_are_separate_and_ordered() {
        let catalog = MemoryCatalog::new("tempZone");
        catalog
            .add_collection("/tempZone/home/u/b", ADMIN_USER)
            .add_collection("/tempZone/home/u/a", ADMIN_USER)
            .add_data_object("/tempZone/home/u/x.txt", ADMIN_USER, 3)
            .add_collection("/tempZone/home/u/a/deep", ADMIN_USER);
        let s = session(&catalog).await;

        let mut handle = catalog
            .open_collection(&s, "/tempZone/home/u", true)
            .await
            .unwrap();
        let cols = drain(&catalog, &s, &mut handle, EntryStream::SubCollections, QueryWindow::UNBOUNDED).await;
        let objs = drain(&catalog, &s, &mut handle, EntryStream::DataObjects, QueryWindow::UNBOUNDED).await;
        assert_eq!(cols, vec!["/tempZone/home/u/a", "/tempZone/home/u/b"]);
        assert_eq!(objs, vec!["/tempZone/home/u/x.txt"]);
        assert_eq!(handle.cursor(EntryStream::SubCollections).total_rows(), 2);

        catalog.close_collection(&s, handle).await.unwrap();
        assert_eq!(catalog.open_handle_count(), 0);
    }

    #[tokio::test]
    async fn test_replica_rows_when_not_trimmed() {
        let catalog = MemoryCatalog::new("tempZone");
        catalog
            .add_resource("archiveResc")
            .add_data_object("/tempZone/home/rods/f", ADMIN_USER, 1)
            .add_replica("/tempZone/home/rods/f", "archiveResc");
        let s = session(&catalog).await;

        let mut handle = catalog
            .open_collection(&s, "/tempZone/home/rods", false)
            .await
            .unwrap();
        let rows = drain(&catalog, &s, &mut handle, EntryStream::DataObjects, QueryWindow::UNBOUNDED).await;
        assert_eq!(rows.len(), 2);

        let mut trimmed = catalog
            .open_collection(&s, "/tempZone/home/rods", true)
            .await
            .unwrap();
        let rows = drain(&catalog, &s, &mut trimmed, EntryStream::DataObjects, QueryWindow::UNBOUNDED).await;
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_non_empty_requires_recursive() {
        let catalog = MemoryCatalog::new("tempZone");
        catalog.add_data_object("/tempZone/home/rods/c/f", ADMIN_USER, 1);
        let s = session(&catalog).await;

        let err = catalog
            .remove(&s, "/tempZone/home/rods/c", RemoveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, CAT_COLLECTION_NOT_EMPTY);

        let opts = RemoveOptions {
            recursive: true,
            ..Default::default()
        };
        catalog.remove(&s, "/tempZone/home/rods/c", opts).await.unwrap();
        assert!(!catalog.exists("/tempZone/home/rods/c"));
        assert!(catalog.exists("/tempZone/trash/home/rods/c/f"));

        let purge = RemoveOptions {
            recursive: true,
            force: true,
            in_trash: true,
        };
        catalog
            .remove(&s, "/tempZone/trash/home/rods/c", purge)
            .await
            .unwrap();
        assert!(!catalog.exists("/tempZone/trash/home/rods/c/f"));
    }

    #[tokio::test]
    async fn test_move_rebases_subtree() {
        let catalog = MemoryCatalog::new("tempZone");
        catalog
            .add_data_object("/tempZone/a/col/f", ADMIN_USER, 1)
            .add_collection("/tempZone/b", ADMIN_USER);
        let s = session(&catalog).await;

        catalog
            .move_object(&s, "/tempZone/a/col", "/tempZone/b/col", MoveKind::Collection)
            .await
            .unwrap();
        assert!(catalog.exists("/tempZone/b/col/f"));
        assert!(!catalog.exists("/tempZone/a/col"));

        let err = catalog
            .move_object(&s, "/tempZone/b/col", "/tempZone/nowhere/col", MoveKind::Collection)
            .await
            .unwrap_err();
        assert_eq!(err.status, USER_FILE_DOES_NOT_EXIST);
    }

    #[tokio::test]
    async fn test_replicate_and_backup() {
        let catalog = MemoryCatalog::new("tempZone");
        catalog
            .add_resource("archiveResc")
            .add_data_object("/tempZone/home/rods/f", ADMIN_USER, 1);
        let s = session(&catalog).await;

        catalog
            .replicate(&s, "/tempZone/home/rods/f", "archiveResc", false)
            .await
            .unwrap();
        assert_eq!(catalog.replicas("/tempZone/home/rods/f").len(), 2);

        let err = catalog
            .replicate(&s, "/tempZone/home/rods/f", "archiveResc", false)
            .await
            .unwrap_err();
        assert_eq!(err.status, SYS_COPY_ALREADY_IN_RESC);
        catalog
            .replicate(&s, "/tempZone/home/rods/f", "archiveResc", true)
            .await
            .unwrap();

        let trim = TrimOptions {
            resource: Some("archiveResc".to_string()),
            ..Default::default()
        };
        catalog
            .trim_replicas(&s, "/tempZone/home/rods/f", &trim)
            .await
            .unwrap();
        let replicas = catalog.replicas("/tempZone/home/rods/f");
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].resource, DEFAULT_RESOURCE);
    }

    #[test]
    fn test_snapshot_from_json() {
        let json = r#"{
            "zone": "tempZone",
            "users": [{"name": "alice"}],
            "groups": [{"name": "lab", "members": ["alice"]}],
            "data_objects": [{"path": "/tempZone/home/alice/notes.txt", "owner": "alice", "size": 12}],
            "acls": [{"path": "/tempZone/home/alice/notes.txt", "subject": "lab", "access": "Read"}]
        }"#;
        let snapshot: CatalogSnapshot = serde_json::from_str(json).unwrap();
        let catalog = MemoryCatalog::from_snapshot(&snapshot).unwrap();
        assert!(catalog.is_collection("/tempZone/home/alice"));
        assert_eq!(
            catalog.list("/tempZone/home/alice"),
            vec!["/tempZone/home/alice/notes.txt"]
        );
    }
}
