use super::node::{Collection, NodeId, NodeItem, NodeState, TreeNode};
use super::reader::{PagedCollectionReader, ReadInfo, ReadOptions, ReadPage, ReadWindow};
use crate::connection::Connection;
use crate::error::{CatalogError, CatalogResult};
use crate::model::entity::User;
use crate::model::object::{base_name, join_path, parent_path, CatalogObject, DataObject, ObjectKind};
use crate::services::catalog::backend::{CollEntry, CollectionHandle};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Collection tree with lazy loading support
///
/// The tree starts with just the collection it was opened on. A collection's
/// children are only read when first asked for (`init`, `all`, `find`, ...)
/// or when the collection was opened recursively. Nodes live in an arena
/// keyed by `NodeId`; a child points at its parent by id, never by
/// reference, and the parent of a root is materialized only on demand.
///
/// The tree is single-writer: every operation takes `&mut self`.
pub struct CollectionTree {
    /// All nodes indexed by ID
    nodes: HashMap<NodeId, TreeNode>,
    /// Path to node ID mapping for quick lookups
    path_to_node: HashMap<String, NodeId>,
    /// Node the tree was opened on
    root_id: NodeId,
    /// Next node ID to assign
    next_id: usize,
    pub(crate) conn: Arc<Connection>,
}

impl fmt::Debug for CollectionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionTree")
            .field("root_id", &self.root_id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl CollectionTree {
    /// Create a tree holding only `root`
    pub(crate) fn new(conn: Arc<Connection>, root: Collection) -> Self {
        let root_id = NodeId(0);
        let mut path_to_node = HashMap::new();
        path_to_node.insert(root.path.clone(), root_id);

        let mut nodes = HashMap::new();
        nodes.insert(
            root_id,
            TreeNode::new(root_id, NodeItem::Collection(root), None),
        );

        Self {
            nodes,
            path_to_node,
            root_id,
            next_id: 1,
            conn,
        }
    }

    /// Get the root node ID
    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Get a node by ID
    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    /// Get a node by absolute path
    pub fn node_by_path(&self, path: &str) -> Option<NodeId> {
        self.path_to_node.get(path.trim_end_matches('/')).copied()
    }

    /// Number of nodes currently materialized
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn path(&self, id: NodeId) -> CatalogResult<&str> {
        Ok(self.node_ref(id)?.path())
    }

    pub fn collection(&self, id: NodeId) -> CatalogResult<&Collection> {
        let node = self.node_ref(id)?;
        node.as_collection()
            .ok_or_else(|| CatalogError::NotACollection(node.path().to_string()))
    }

    pub fn data_object(&self, id: NodeId) -> Option<&DataObject> {
        self.node(id).and_then(TreeNode::as_data_object)
    }

    pub(crate) fn node_ref(&self, id: NodeId) -> CatalogResult<&TreeNode> {
        self.nodes.get(&id).ok_or(CatalogError::NodeNotFound(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> CatalogResult<&mut TreeNode> {
        self.nodes.get_mut(&id).ok_or(CatalogError::NodeNotFound(id))
    }

    pub(crate) fn collection_mut(&mut self, id: NodeId) -> CatalogResult<&mut Collection> {
        let node = self.nodes.get_mut(&id).ok_or(CatalogError::NodeNotFound(id))?;
        match &mut node.item {
            NodeItem::Collection(c) => Ok(c),
            NodeItem::DataObject(d) => Err(CatalogError::NotACollection(d.path.clone())),
        }
    }

    /// Add a node; the path index keeps the first node seen for a path
    pub(crate) fn add_node(&mut self, item: NodeItem, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        self.path_to_node
            .entry(item.path().to_string())
            .or_insert(id);
        self.nodes.insert(id, TreeNode::new(id, item, parent));
        id
    }

    /// Point the path index at `id` under its new path
    pub(crate) fn reindex(&mut self, id: NodeId, old_path: &str, new_path: String) {
        if self.path_to_node.get(old_path) == Some(&id) {
            self.path_to_node.remove(old_path);
        }
        self.path_to_node.insert(new_path, id);
    }

    /// `id` followed by every cached descendant, depth first
    pub(crate) fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            if let Some(col) = node.as_collection() {
                stack.extend(col.children.iter().rev().copied());
            }
        }
        out
    }

    /// Set the read options used by `init` and `refresh`
    pub fn set_read_options(&mut self, id: NodeId, options: ReadOptions) -> CatalogResult<()> {
        self.collection_mut(id)?.read_options = options;
        Ok(())
    }

    /// Counts from the collection's last read
    pub fn read_info(&self, id: NodeId) -> CatalogResult<Option<ReadInfo>> {
        Ok(self.collection(id)?.read_info)
    }

    /// Open the remote read handle (Unopened → Opened)
    ///
    /// A collection that already holds a handle is left alone.
    pub async fn open(&mut self, id: NodeId) -> CatalogResult<()> {
        let col = self.collection(id)?;
        if col.handle.is_some() {
            return Ok(());
        }
        let handle = self.open_handle(&col.path.clone(), col.trim_replicas).await?;

        let col = self.collection_mut(id)?;
        col.handle = Some(handle);
        col.state = NodeState::Opened;
        Ok(())
    }

    async fn open_handle(&self, path: &str, trim_replicas: bool) -> CatalogResult<CollectionHandle> {
        let session = self.conn.pool().acquire().await?;
        let handle = session
            .backend()
            .open_collection(session.session(), path, trim_replicas)
            .await
            .map_err(|e| CatalogError::remote("open collection", path, e))?;
        tracing::debug!(path, handle = handle.id(), "opened collection");
        Ok(handle)
    }

    /// Release the node's own handle, if any
    pub(crate) async fn close_handle(&mut self, id: NodeId) -> CatalogResult<()> {
        let col = self.collection_mut(id)?;
        let Some(handle) = col.handle.take() else {
            return Ok(());
        };
        col.state = match col.state {
            NodeState::Populated | NodeState::Closed => NodeState::Closed,
            NodeState::Opened | NodeState::Unopened => NodeState::Unopened,
        };
        let path = col.path.clone();

        let conn = Arc::clone(&self.conn);
        let session = conn.pool().acquire().await?;
        session
            .backend()
            .close_collection(session.session(), handle)
            .await
            .map_err(|e| CatalogError::remote("close collection", path.as_str(), e))?;
        tracing::debug!(path = %path, "closed collection");
        Ok(())
    }

    /// Close the handle of `id` and of every cached descendant, children first
    pub async fn close(&mut self, id: NodeId) -> CatalogResult<()> {
        let order = self.descendants(id);
        for node in order.into_iter().rev() {
            if self.nodes.get(&node).is_some_and(TreeNode::is_collection) {
                self.close_handle(node).await?;
            }
        }
        Ok(())
    }

    /// Populate the collection unless it already has been
    ///
    /// Idempotent: a populated collection is not read again until a mutation
    /// invalidates it. With `recursive` set, every child collection is
    /// initialized too, each after its parent's handle has been released.
    pub async fn init(&mut self, id: NodeId) -> CatalogResult<()> {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let col = self.collection(current)?;
            if col.is_initialized() {
                continue;
            }
            let recursive = col.recursive;
            let children = self.load(current).await?;
            if recursive {
                pending.extend(children.into_iter().rev());
            }
        }
        Ok(())
    }

    /// Re-read the collection regardless of its state
    ///
    /// Callers must refresh after mutations; nothing refreshes implicitly.
    /// A recursive collection re-reads every child collection below it too,
    /// including ones that were already populated.
    pub async fn refresh(&mut self, id: NodeId) -> CatalogResult<()> {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let recursive = self.collection(current)?.recursive;
            let children = self.load(current).await?;
            if recursive {
                pending.extend(children.into_iter().rev());
            }
        }
        Ok(())
    }

    /// Replace the children with one global window of the listing
    ///
    /// Sub-collections come before data objects. The returned counts are
    /// also kept as the collection's `read_info`.
    pub async fn read_page(&mut self, id: NodeId, window: ReadWindow) -> CatalogResult<ReadInfo> {
        let mut handle = self.take_or_open(id).await?;
        let conn = Arc::clone(&self.conn);
        let result = PagedCollectionReader::new(conn.pool())
            .read_window(&mut handle, window)
            .await;
        self.finish_read(id, handle, result).await?;
        self.collection(id)?
            .read_info
            .ok_or(CatalogError::NodeNotFound(id))
    }

    /// Open (if needed) → read → populate → close; returns child collections
    pub(super) async fn load(&mut self, id: NodeId) -> CatalogResult<Vec<NodeId>> {
        let mut handle = self.take_or_open(id).await?;
        let options = self.collection(id)?.read_options.clone();
        let conn = Arc::clone(&self.conn);
        let result = PagedCollectionReader::new(conn.pool())
            .read_full(&mut handle, &options)
            .await;
        self.finish_read(id, handle, result).await
    }

    async fn take_or_open(&mut self, id: NodeId) -> CatalogResult<CollectionHandle> {
        self.open(id).await?;
        let col = self.collection_mut(id)?;
        col.state = NodeState::Opened;
        let path = col.path.clone();
        match col.handle.take() {
            Some(handle) => Ok(handle),
            None => Err(CatalogError::NotACollection(path)),
        }
    }

    async fn finish_read(
        &mut self,
        id: NodeId,
        handle: CollectionHandle,
        result: CatalogResult<ReadPage>,
    ) -> CatalogResult<Vec<NodeId>> {
        self.collection_mut(id)?.handle = Some(handle);

        let populated = match result {
            Ok(page) => self.populate(id, page).await,
            Err(e) => Err(e),
        };
        let children = match populated {
            Ok(children) => children,
            Err(e) => {
                if let Err(close_err) = self.close_handle(id).await {
                    tracing::warn!(error = %close_err, "failed to close collection after read error");
                }
                self.collection_mut(id)?.invalidate();
                return Err(e);
            }
        };

        self.close_handle(id).await?;
        Ok(children)
    }

    /// Turn rows into child nodes (Opened → Populated)
    ///
    /// Owners are resolved before anything is touched, so a cache miss leaves
    /// the old children in place. Child collections already in the tree are
    /// reused by path; data object nodes are rebuilt.
    async fn populate(&mut self, id: NodeId, page: ReadPage) -> CatalogResult<Vec<NodeId>> {
        let owners = self.resolve_owners(&page.rows).await?;
        let (recursive, trim_replicas, own_owner) = {
            let col = self.collection(id)?;
            let own_owner = match (&col.owner, col.owner_name.is_empty()) {
                (None, false) => Some(col.owner_name.clone()),
                _ => None,
            };
            (col.recursive, col.trim_replicas, own_owner)
        };
        let own_owner = match own_owner {
            Some(name) => Some(self.resolve_owner(&name).await?),
            None => None,
        };

        // Drop stale children first so rebuilt data objects take over their paths.
        let old_children = std::mem::take(&mut self.collection_mut(id)?.children);
        let stale: Vec<NodeId> = {
            let listed: HashSet<&str> = page
                .rows
                .iter()
                .filter(|row| row.kind == ObjectKind::Collection)
                .map(|row| row.path.as_str())
                .collect();
            old_children
                .into_iter()
                .filter(|old| {
                    self.nodes
                        .get(old)
                        .map_or(true, |n| !n.is_collection() || !listed.contains(n.path()))
                })
                .collect()
        };
        for old in stale {
            self.discard(old).await;
        }

        let mut children = Vec::with_capacity(page.rows.len());
        let mut sub_collections = Vec::new();

        for row in page.rows {
            let owner = owners.get(&row.owner_name).cloned();
            let child = if row.kind == ObjectKind::Collection {
                let child = self.collection_child(id, row, owner, recursive, trim_replicas);
                sub_collections.push(child);
                child
            } else {
                self.add_node(NodeItem::DataObject(data_object_from(row, owner)), Some(id))
            };
            children.push(child);
        }

        let col = self.collection_mut(id)?;
        col.children = children;
        col.read_info = Some(page.info);
        col.state = NodeState::Populated;
        if let Some(owner) = own_owner {
            col.owner = Some(owner);
        }
        tracing::debug!(
            path = %col.path,
            children = col.children.len(),
            "populated collection"
        );
        Ok(sub_collections)
    }

    fn collection_child(
        &mut self,
        parent: NodeId,
        row: CollEntry,
        owner: Option<Arc<User>>,
        recursive: bool,
        trim_replicas: bool,
    ) -> NodeId {
        let existing = self
            .path_to_node
            .get(&row.path)
            .copied()
            .filter(|nid| self.nodes.get(nid).is_some_and(TreeNode::is_collection));

        if let Some(nid) = existing {
            if let Some(node) = self.nodes.get_mut(&nid) {
                node.parent = Some(parent);
                if let Some(col) = node.as_collection_mut() {
                    col.owner_name = row.owner_name;
                    col.owner = owner;
                    col.create_time = row.create_time;
                    col.modify_time = row.modify_time;
                }
            }
            return nid;
        }

        let mut col = Collection::new(row.path, recursive, trim_replicas);
        col.owner_name = row.owner_name;
        col.owner = owner;
        col.create_time = row.create_time;
        col.modify_time = row.modify_time;
        self.add_node(NodeItem::Collection(col), Some(parent))
    }

    async fn resolve_owners(
        &self,
        rows: &[CollEntry],
    ) -> CatalogResult<HashMap<String, Arc<User>>> {
        let mut owners = HashMap::new();
        for row in rows {
            if !owners.contains_key(&row.owner_name) {
                let user = self.resolve_owner(&row.owner_name).await?;
                owners.insert(row.owner_name.clone(), user);
            }
        }
        Ok(owners)
    }

    async fn resolve_owner(&self, name: &str) -> CatalogResult<Arc<User>> {
        self.conn
            .entities()
            .resolve_user(self.conn.pool(), name)
            .await
    }

    /// Remove a subtree from the arena, closing any handle it still holds
    pub(crate) async fn discard(&mut self, id: NodeId) {
        for node in self.descendants(id).into_iter().rev() {
            if self
                .nodes
                .get(&node)
                .and_then(TreeNode::as_collection)
                .is_some_and(Collection::is_opened)
            {
                if let Err(e) = self.close_handle(node).await {
                    tracing::warn!(error = %e, "failed to close discarded collection");
                }
            }
            if let Some(removed) = self.nodes.remove(&node) {
                if self.path_to_node.get(removed.path()) == Some(&node) {
                    self.path_to_node.remove(removed.path());
                }
            }
        }
    }

    /// Every child, populating first
    pub async fn all(&mut self, id: NodeId) -> CatalogResult<Vec<NodeId>> {
        self.init(id).await?;
        Ok(self.collection(id)?.children.clone())
    }

    /// Child collections, populating first
    pub async fn collections(&mut self, id: NodeId) -> CatalogResult<Vec<NodeId>> {
        let all = self.all(id).await?;
        Ok(all
            .into_iter()
            .filter(|c| self.nodes.get(c).is_some_and(TreeNode::is_collection))
            .collect())
    }

    /// Child data objects, populating first
    pub async fn data_objects(&mut self, id: NodeId) -> CatalogResult<Vec<NodeId>> {
        let all = self.all(id).await?;
        Ok(all
            .into_iter()
            .filter(|c| self.nodes.get(c).is_some_and(|n| !n.is_collection()))
            .collect())
    }

    /// Visit every data object below `id`, depth first in listing order
    ///
    /// Collections are populated as they are reached. The first error from
    /// the callback stops the walk.
    pub async fn walk<F>(&mut self, id: NodeId, mut callback: F) -> CatalogResult<()>
    where
        F: FnMut(NodeId, &DataObject) -> CatalogResult<()>,
    {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let is_collection = self.node_ref(current)?.is_collection();
            if is_collection {
                let children = self.all(current).await?;
                stack.extend(children.into_iter().rev());
            } else if let Some(obj) = self.data_object(current) {
                callback(current, obj)?;
            }
        }
        Ok(())
    }

    /// Child matching a name, a path relative to `id`, or an absolute path
    pub async fn find(&mut self, id: NodeId, path: &str) -> CatalogResult<Option<NodeId>> {
        let children = self.all(id).await?;
        let relative = join_path(&self.collection(id)?.path, path);
        Ok(children.into_iter().find(|c| {
            self.nodes.get(c).is_some_and(|n| {
                n.path() == path || n.name() == path || n.path() == relative
            })
        }))
    }

    /// Descendant at a multi-segment path relative to `id` (or absolute)
    ///
    /// Each intermediate collection is populated on the way down.
    pub async fn find_recursive(&mut self, id: NodeId, path: &str) -> CatalogResult<Option<NodeId>> {
        let base = self.collection(id)?.path.clone();
        let relative = if path.starts_with('/') {
            match path.strip_prefix(base.as_str()) {
                Some(rest) if rest.is_empty() => return Ok(Some(id)),
                Some(rest) if rest.starts_with('/') => rest.to_string(),
                _ => return Ok(None),
            }
        } else {
            path.to_string()
        };

        let mut current = id;
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            if !self.node_ref(current)?.is_collection() {
                return Ok(None);
            }
            match self.find(current, segment).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Child collection by name or path
    pub async fn cd(&mut self, id: NodeId, path: &str) -> CatalogResult<Option<NodeId>> {
        Ok(self
            .find(id, path)
            .await?
            .filter(|c| self.nodes.get(c).is_some_and(TreeNode::is_collection)))
    }

    /// Child data object by name or path
    pub async fn get(&mut self, id: NodeId, path: &str) -> CatalogResult<Option<NodeId>> {
        Ok(self
            .find(id, path)
            .await?
            .filter(|c| self.nodes.get(c).is_some_and(|n| !n.is_collection())))
    }

    pub async fn exists(&mut self, id: NodeId, path: &str) -> CatalogResult<bool> {
        Ok(self.find(id, path).await?.is_some())
    }

    /// Parent collection, materializing it on first request
    ///
    /// Returns `None` for the catalog root.
    pub async fn parent(&mut self, id: NodeId) -> CatalogResult<Option<NodeId>> {
        let node = self.node_ref(id)?;
        if let Some(parent) = node.parent {
            return Ok(Some(parent));
        }
        let path = node.path().to_string();
        if path == "/" {
            return Ok(None);
        }

        let parent_path = parent_path(&path).to_string();
        let parent = match self.node_by_path(&parent_path) {
            Some(existing) => existing,
            None => {
                let (recursive, trim_replicas) = match node.as_collection() {
                    Some(c) => (c.recursive, c.trim_replicas),
                    None => (false, true),
                };
                let col = self
                    .conn
                    .collection_node(&parent_path, recursive, trim_replicas, false)
                    .await?;
                self.add_node(NodeItem::Collection(col), None)
            }
        };
        self.node_mut(id)?.parent = Some(parent);
        Ok(Some(parent))
    }

    /// Listing in `Collection: path` / `\tC: name` form, populating first
    pub async fn listing(&mut self, id: NodeId) -> CatalogResult<Listing<'_>> {
        self.init(id).await?;
        Ok(Listing { tree: self, id })
    }
}

fn data_object_from(row: CollEntry, owner: Option<Arc<User>>) -> DataObject {
    DataObject {
        name: base_name(&row.path).to_string(),
        path: row.path,
        owner_name: row.owner_name,
        owner,
        create_time: row.create_time,
        modify_time: row.modify_time,
        size: row.size,
        checksum: row.checksum,
        data_id: row.data_id,
        replica: row.replica,
    }
}

impl Drop for CollectionTree {
    fn drop(&mut self) {
        let open: Vec<&str> = self
            .nodes
            .values()
            .filter_map(TreeNode::as_collection)
            .filter(|c| c.is_opened())
            .map(|c| c.path.as_str())
            .collect();
        if !open.is_empty() {
            tracing::warn!(
                count = open.len(),
                paths = ?open,
                "collection tree dropped with open remote handles"
            );
        }
    }
}

/// Display adapter for one populated collection
pub struct Listing<'a> {
    tree: &'a CollectionTree,
    id: NodeId,
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(col) = self.tree.collection(self.id) else {
            return Ok(());
        };
        writeln!(f, "Collection: {}", col.path)?;
        for child in &col.children {
            if let Some(node) = self.tree.node(*child) {
                writeln!(f, "\t{}: {}", node.kind(), node.name())?;
            }
        }
        Ok(())
    }
}
