//! Mutating and per-object operations on tree nodes
//!
//! Every operation validates its arguments before the first remote call, so
//! a usage error never leaves the catalog half changed. Walks over a subtree
//! abort on the first remote failure; whatever was already applied stays
//! applied.

use super::node::{Collection, NodeId, NodeItem};
use super::tree::CollectionTree;
use crate::error::{CatalogError, CatalogResult};
use crate::model::acl::{AccessControlEntry, AccessLevel};
use crate::model::meta::MetaCollection;
use crate::model::object::{base_name, join_path, parent_path, CatalogObject, DataObject};
use crate::services::catalog::backend::{Avu, MoveKind, ObjStat, RemoveOptions, TrimOptions};
use std::collections::HashSet;
use std::sync::Arc;

/// Target of a move or copy: an absolute or relative path, or a node of this tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Relative paths resolve against the source's parent collection
    Path(String),
    Node(NodeId),
}

impl From<&str> for Destination {
    fn from(path: &str) -> Self {
        Destination::Path(path.to_string())
    }
}

impl From<String> for Destination {
    fn from(path: String) -> Self {
        Destination::Path(path)
    }
}

impl From<NodeId> for Destination {
    fn from(id: NodeId) -> Self {
        Destination::Node(id)
    }
}

/// Replica-level operation applied to every data object of a subtree
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplicaOp {
    Trim(TrimOptions),
    Replicate(String),
    Backup(String),
    MoveToResource(String),
}

impl ReplicaOp {
    fn name(&self) -> &'static str {
        match self {
            ReplicaOp::Trim(_) => "trim replicas",
            ReplicaOp::Replicate(_) => "replicate",
            ReplicaOp::Backup(_) => "backup",
            ReplicaOp::MoveToResource(_) => "move to resource",
        }
    }

    /// Physical moves always rebuild listings; the rest honour `trim_replicas`
    fn refreshes(&self, col: &Collection) -> bool {
        matches!(self, ReplicaOp::MoveToResource(_)) || !col.trim_replicas
    }
}

enum Visit {
    Enter(NodeId),
    Exit(NodeId),
}

impl CollectionTree {
    fn resolve_destination(&self, id: NodeId, dest: Destination) -> CatalogResult<String> {
        let source = self.path(id)?.to_string();
        let dir = match dest {
            Destination::Path(path) => {
                let trimmed = path.trim_end_matches('/');
                if path.is_empty() {
                    return Err(CatalogError::InvalidDestination(
                        "empty destination path".to_string(),
                    ));
                }
                if path.starts_with('/') {
                    if trimmed.is_empty() {
                        "/".to_string()
                    } else {
                        trimmed.to_string()
                    }
                } else {
                    join_path(parent_path(&source), trimmed)
                }
            }
            Destination::Node(dest_id) => {
                let node = self.node_ref(dest_id)?;
                if !node.is_collection() {
                    return Err(CatalogError::InvalidDestination(format!(
                        "{} is not a collection",
                        node.path()
                    )));
                }
                node.path().to_string()
            }
        };

        if dir == source || dir.starts_with(&format!("{source}/")) {
            return Err(CatalogError::InvalidDestination(format!(
                "{dir} is inside {source}"
            )));
        }
        Ok(dir)
    }

    /// Move the node into the collection at `dest`, keeping its name
    ///
    /// Cached descendants follow the move; every moved collection is left
    /// `Unopened` and must be re-initialized before its children are trusted.
    pub async fn move_to(&mut self, id: NodeId, dest: impl Into<Destination>) -> CatalogResult<()> {
        let dir = self.resolve_destination(id, dest.into())?;
        let target = join_path(&dir, self.node_ref(id)?.name());
        self.relocate(id, target).await
    }

    /// Rename within the same parent collection
    pub async fn rename(&mut self, id: NodeId, new_name: &str) -> CatalogResult<()> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(CatalogError::InvalidName(new_name.to_string()));
        }
        let source = self.path(id)?;
        let target = join_path(parent_path(source), new_name);
        self.relocate(id, target).await
    }

    async fn relocate(&mut self, id: NodeId, target: String) -> CatalogResult<()> {
        let node = self.node_ref(id)?;
        let source = node.path().to_string();
        let kind = if node.is_collection() {
            MoveKind::Collection
        } else {
            MoveKind::DataObject
        };
        let old_parent = node.parent;

        self.close(id).await?;
        {
            let conn = Arc::clone(&self.conn);
            let session = conn.pool().acquire().await?;
            session
                .backend()
                .move_object(session.session(), &source, &target, kind)
                .await
                .map_err(|e| CatalogError::remote("move", source.as_str(), e))?;
        }

        self.rebase_subtree(id, &source, &target);

        if let Some(parent) = old_parent {
            if let Ok(col) = self.collection_mut(parent) {
                col.children.retain(|c| *c != id);
                col.invalidate();
            }
        }
        let new_parent = self.node_by_path(parent_path(&target));
        if let Some(parent) = new_parent {
            self.adopt(parent, id)?;
        }
        self.node_mut(id)?.parent = new_parent;

        self.conn.forget_stat(&source);
        self.conn.forget_stat(&target);
        tracing::info!(from = %source, to = %target, "moved");
        Ok(())
    }

    /// Rewrite paths below `id` after a move and mark its collections stale
    fn rebase_subtree(&mut self, id: NodeId, source: &str, target: &str) {
        for nid in self.descendants(id) {
            let Ok(node) = self.node_mut(nid) else {
                continue;
            };
            let old = node.path().to_string();
            let new = match old.strip_prefix(source) {
                Some(rest) => format!("{target}{rest}"),
                None => continue,
            };
            node.set_path(new.clone());
            if let Some(col) = node.as_collection_mut() {
                col.invalidate();
            }
            self.reindex(nid, &old, new);
        }
    }

    /// Copy the node into the collection at `dest`
    ///
    /// A collection is recreated there level by level; the new top node is
    /// refreshed once after everything has been copied. Returns the node of
    /// the copy.
    pub async fn copy_to(&mut self, id: NodeId, dest: impl Into<Destination>) -> CatalogResult<NodeId> {
        let dir = self.resolve_destination(id, dest.into())?;
        let name = self.node_ref(id)?.name().to_string();

        if !self.node_ref(id)?.is_collection() {
            let source = self.path(id)?.to_string();
            let target = join_path(&dir, &name);
            self.copy_data_object(&source, &target).await?;
            tracing::info!(from = %source, to = %target, "copied data object");

            let copy = self.copied_object(id, target)?;
            let parent = self.node_by_path(&dir);
            let copy_id = self.add_node(NodeItem::DataObject(copy), parent);
            if let Some(parent) = parent {
                self.adopt(parent, copy_id)?;
            }
            return Ok(copy_id);
        }

        let dest_id = self.materialize(&dir).await?;
        let top = self.create_sub_collection(dest_id, &name).await?;

        let mut pending = vec![(id, top)];
        while let Some((src, dst)) = pending.pop() {
            self.init(src).await?;
            let dst_path = self.path(dst)?.to_string();
            let children = self.collection(src)?.children.clone();
            let mut copied = HashSet::new();
            for child in children {
                let (path, is_collection, child_name) = {
                    let node = self.node_ref(child)?;
                    (node.path().to_string(), node.is_collection(), node.name().to_string())
                };
                if is_collection {
                    let new_child = self.create_sub_collection(dst, &child_name).await?;
                    pending.push((child, new_child));
                } else if copied.insert(path.clone()) {
                    self.copy_data_object(&path, &join_path(&dst_path, &child_name))
                        .await?;
                }
            }
        }

        self.refresh(top).await?;
        tracing::info!(from = %self.path(id)?, to = %self.path(top)?, "copied collection");
        Ok(top)
    }

    fn copied_object(&self, id: NodeId, target: String) -> CatalogResult<DataObject> {
        let mut obj = self
            .data_object(id)
            .cloned()
            .ok_or(CatalogError::NodeNotFound(id))?;
        obj.name = base_name(&target).to_string();
        obj.path = target;
        obj.replica = None;
        Ok(obj)
    }

    async fn copy_data_object(&self, source: &str, target: &str) -> CatalogResult<()> {
        let session = self.conn.pool().acquire().await?;
        session
            .backend()
            .copy_data_object(session.session(), source, target)
            .await
            .map_err(|e| CatalogError::remote("copy", source, e))
    }

    /// Node for the collection at `path`, creating a parentless one if absent
    async fn materialize(&mut self, path: &str) -> CatalogResult<NodeId> {
        if let Some(existing) = self.node_by_path(path) {
            self.collection(existing)?;
            return Ok(existing);
        }
        let (recursive, trim_replicas) = {
            let root = self.collection(self.root_id())?;
            (root.recursive, root.trim_replicas)
        };
        let col = self
            .conn
            .collection_node(path, recursive, trim_replicas, true)
            .await?;
        Ok(self.add_node(NodeItem::Collection(col), None))
    }

    /// Create a child collection and return its node
    ///
    /// The parent is marked stale; the child starts `Unopened` and inherits
    /// the parent's `recursive` and `trim_replicas` flags.
    pub async fn create_sub_collection(&mut self, id: NodeId, name: &str) -> CatalogResult<NodeId> {
        if name.is_empty() || name.contains('/') {
            return Err(CatalogError::InvalidName(name.to_string()));
        }
        let parent = self.collection(id)?;
        let path = join_path(&parent.path, name);
        let (recursive, trim_replicas) = (parent.recursive, parent.trim_replicas);

        {
            let session = self.conn.pool().acquire().await?;
            session
                .backend()
                .create_collection(session.session(), &path)
                .await
                .map_err(|e| CatalogError::remote("create collection", path.as_str(), e))?;
        }
        let col = self
            .conn
            .collection_node(&path, recursive, trim_replicas, true)
            .await?;

        let child = self.add_node(NodeItem::Collection(col), Some(id));
        self.adopt(id, child)?;
        tracing::info!(path = %path, "created collection");
        Ok(child)
    }

    /// Attach a node created by a mutation; the parent must be re-read
    fn adopt(&mut self, parent: NodeId, child: NodeId) -> CatalogResult<()> {
        let col = self.collection_mut(parent)?;
        col.children.push(child);
        col.invalidate();
        Ok(())
    }

    /// Trim replicas of every data object below the node
    pub async fn trim(&mut self, id: NodeId, options: TrimOptions) -> CatalogResult<()> {
        self.replica_walk(id, ReplicaOp::Trim(options)).await
    }

    /// Replicate every data object below the node onto `resource`
    pub async fn replicate(&mut self, id: NodeId, resource: &str) -> CatalogResult<()> {
        self.replica_walk(id, ReplicaOp::Replicate(resource.to_string()))
            .await
    }

    /// Like `replicate`, but objects already on `resource` are not an error
    pub async fn backup(&mut self, id: NodeId, resource: &str) -> CatalogResult<()> {
        self.replica_walk(id, ReplicaOp::Backup(resource.to_string()))
            .await
    }

    /// Move every data object below the node onto `resource`
    pub async fn move_to_resource(&mut self, id: NodeId, resource: &str) -> CatalogResult<()> {
        self.replica_walk(id, ReplicaOp::MoveToResource(resource.to_string()))
            .await
    }

    /// Apply `op` to each data object, children before their collection
    ///
    /// Each collection is refreshed once its subtree is done, unless it lists
    /// trimmed replicas and `op` leaves listings alone.
    async fn replica_walk(&mut self, id: NodeId, op: ReplicaOp) -> CatalogResult<()> {
        if !self.node_ref(id)?.is_collection() {
            let path = self.path(id)?.to_string();
            return self.apply_replica_op(&path, &op).await;
        }

        let mut stack = vec![Visit::Enter(id)];
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(current) => {
                    self.init(current).await?;
                    let children = self.collection(current)?.children.clone();
                    let mut objects = Vec::new();
                    let mut sub_collections = Vec::new();
                    for child in children {
                        let node = self.node_ref(child)?;
                        if node.is_collection() {
                            sub_collections.push(child);
                        } else if !objects.iter().any(|p: &String| p == node.path()) {
                            objects.push(node.path().to_string());
                        }
                    }
                    for path in objects {
                        self.apply_replica_op(&path, &op).await?;
                    }
                    stack.push(Visit::Exit(current));
                    stack.extend(sub_collections.into_iter().rev().map(Visit::Enter));
                }
                Visit::Exit(current) => {
                    // Children were reloaded on their own exit.
                    if op.refreshes(self.collection(current)?) {
                        self.load(current).await?;
                    }
                }
            }
        }
        tracing::info!(path = %self.path(id)?, op = op.name(), "replica walk finished");
        Ok(())
    }

    async fn apply_replica_op(&self, path: &str, op: &ReplicaOp) -> CatalogResult<()> {
        let session = self.conn.pool().acquire().await?;
        let backend = session.backend();
        let result = match op {
            ReplicaOp::Trim(options) => backend.trim_replicas(session.session(), path, options).await,
            ReplicaOp::Replicate(resource) => {
                backend.replicate(session.session(), path, resource, false).await
            }
            ReplicaOp::Backup(resource) => {
                backend.replicate(session.session(), path, resource, true).await
            }
            ReplicaOp::MoveToResource(resource) => {
                backend.move_to_resource(session.session(), path, resource).await
            }
        };
        result.map_err(|e| CatalogError::remote(op.name(), path, e))?;
        tracing::debug!(path, op = op.name(), "applied replica operation");
        Ok(())
    }

    /// Remove the node remotely and detach it from the tree
    ///
    /// Without `force` the object goes to the trash. On success the node and
    /// its cached descendants are gone from the arena and the parent is
    /// marked stale.
    pub async fn rm(&mut self, id: NodeId, recursive: bool, force: bool) -> CatalogResult<()> {
        self.remove_with(
            id,
            RemoveOptions {
                recursive,
                force,
                in_trash: false,
            },
        )
        .await
    }

    /// Remove without going through the trash
    pub async fn delete(&mut self, id: NodeId, recursive: bool) -> CatalogResult<()> {
        self.rm(id, recursive, true).await
    }

    /// Move to the trash
    pub async fn trash(&mut self, id: NodeId, recursive: bool) -> CatalogResult<()> {
        self.rm(id, recursive, false).await
    }

    /// Remove the whole subtree outright
    pub async fn destroy(&mut self, id: NodeId) -> CatalogResult<()> {
        self.rm(id, true, true).await
    }

    /// Permanently remove an entry that already sits in the trash
    pub async fn rm_trash(&mut self, id: NodeId) -> CatalogResult<()> {
        self.remove_with(
            id,
            RemoveOptions {
                recursive: true,
                force: true,
                in_trash: true,
            },
        )
        .await
    }

    async fn remove_with(&mut self, id: NodeId, options: RemoveOptions) -> CatalogResult<()> {
        let node = self.node_ref(id)?;
        let path = node.path().to_string();
        let parent = node.parent;

        self.close(id).await?;
        {
            let session = self.conn.pool().acquire().await?;
            session
                .backend()
                .remove(session.session(), &path, options)
                .await
                .map_err(|e| CatalogError::remote("remove", path.as_str(), e))?;
        }

        self.discard(id).await;
        if let Some(parent) = parent {
            if let Ok(col) = self.collection_mut(parent) {
                col.children.retain(|c| *c != id);
                col.invalidate();
            }
        }
        self.conn.forget_stat(&path);
        tracing::info!(path = %path, ?options, "removed");
        Ok(())
    }

    /// Stat the node, through the connection's stat cache
    pub async fn stat(&self, id: NodeId) -> CatalogResult<ObjStat> {
        self.conn.stat(self.path(id)?, false).await
    }

    /// Permissions on the node, resolved against the entity cache
    pub async fn acl(&self, id: NodeId) -> CatalogResult<Vec<AccessControlEntry>> {
        let path = self.path(id)?;
        let raw = {
            let session = self.conn.pool().acquire().await?;
            session
                .backend()
                .get_acl(session.session(), path, self.conn.zone())
                .await
                .map_err(|e| CatalogError::remote("get acl", path, e))?
        };
        self.conn
            .acl_resolver()
            .resolve(&raw, self.conn.entities(), self.conn.pool())
            .await
    }

    /// Set `subject`'s access level; `Null` revokes
    pub async fn chmod(
        &self,
        id: NodeId,
        subject: &str,
        level: AccessLevel,
        recursive: bool,
    ) -> CatalogResult<()> {
        let path = self.path(id)?;
        let session = self.conn.pool().acquire().await?;
        session
            .backend()
            .chmod(session.session(), path, subject, self.conn.zone(), level, recursive)
            .await
            .map_err(|e| CatalogError::remote("chmod", path, e))?;
        tracing::info!(path, subject, %level, recursive, "changed access");
        Ok(())
    }

    /// `chmod` for a user or group already resolved from the entity cache
    pub async fn grant_access(
        &self,
        id: NodeId,
        subject: &dyn CatalogObject,
        level: AccessLevel,
        recursive: bool,
    ) -> CatalogResult<()> {
        self.chmod(id, subject.name(), level, recursive).await
    }

    pub async fn set_inheritance(&self, id: NodeId, inherit: bool, recursive: bool) -> CatalogResult<()> {
        let path = &self.collection(id)?.path;
        let session = self.conn.pool().acquire().await?;
        session
            .backend()
            .set_inheritance(session.session(), path, inherit, recursive)
            .await
            .map_err(|e| CatalogError::remote("set inheritance", path.as_str(), e))
    }

    pub async fn inheritance(&self, id: NodeId) -> CatalogResult<bool> {
        let path = &self.collection(id)?.path;
        let session = self.conn.pool().acquire().await?;
        session
            .backend()
            .get_inheritance(session.session(), path)
            .await
            .map_err(|e| CatalogError::remote("get inheritance", path.as_str(), e))
    }

    /// Metadata handle of the node, created on first use
    ///
    /// A collection is initialized first.
    pub async fn meta(&mut self, id: NodeId) -> CatalogResult<&mut MetaCollection> {
        if self.node_ref(id)?.is_collection() {
            self.init(id).await?;
        }
        let node = self.node_mut(id)?;
        let (path, kind) = (node.path().to_string(), node.kind());
        Ok(node.meta.get_or_insert_with(|| MetaCollection::new(path, kind)))
    }

    /// AVUs of the node whose attribute is `name`
    pub async fn attribute(&mut self, id: NodeId, name: &str) -> CatalogResult<Vec<Avu>> {
        let conn = Arc::clone(&self.conn);
        self.meta(id).await?.attribute(conn.pool(), name).await
    }

    pub async fn add_meta(&mut self, id: NodeId, avu: Avu) -> CatalogResult<()> {
        let conn = Arc::clone(&self.conn);
        self.meta(id).await?.add(conn.pool(), avu).await
    }

    /// Delete every AVU with attribute `name`
    pub async fn delete_meta(&mut self, id: NodeId, name: &str) -> CatalogResult<()> {
        let conn = Arc::clone(&self.conn);
        let meta = self.meta(id).await?;
        for avu in meta.attribute(conn.pool(), name).await? {
            meta.delete(conn.pool(), &avu).await?;
        }
        Ok(())
    }
}
