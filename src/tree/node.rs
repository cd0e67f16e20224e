use crate::model::entity::User;
use crate::model::meta::MetaCollection;
use crate::model::object::{CatalogObject, DataObject, ObjectKind};
use crate::services::catalog::backend::CollectionHandle;
use crate::tree::reader::{ReadInfo, ReadOptions};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Lifecycle of a collection node
///
/// `init` walks Unopened → Opened → Populated → Closed. A node in `Closed`
/// has a valid children list and no remote handle. Mutations send a node back
/// to `Unopened`; `refresh` re-enters at `Opened` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Children never read, or invalidated by a mutation
    Unopened,
    /// Remote read handle open, children not read yet
    Opened,
    /// Children read, remote read handle still open
    Populated,
    /// Children read and handle released
    Closed,
}

/// A collection as held in the tree
#[derive(Debug, Clone)]
pub struct Collection {
    pub path: String,
    pub name: String,
    pub owner_name: String,
    /// Resolved when the collection is initialized
    pub owner: Option<Arc<User>>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    /// Initialize every child collection along with this one
    pub recursive: bool,
    /// List one row per data object instead of one per replica
    pub trim_replicas: bool,
    pub(crate) state: NodeState,
    pub(crate) handle: Option<CollectionHandle>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) read_options: ReadOptions,
    pub(crate) read_info: Option<ReadInfo>,
}

impl Collection {
    pub fn new(path: impl Into<String>, recursive: bool, trim_replicas: bool) -> Self {
        let path = path.into();
        let path = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self {
            name: crate::model::object::base_name(&path).to_string(),
            path,
            owner_name: String::new(),
            owner: None,
            create_time: DateTime::UNIX_EPOCH,
            modify_time: DateTime::UNIX_EPOCH,
            recursive,
            trim_replicas,
            state: NodeState::Unopened,
            handle: None,
            children: Vec::new(),
            read_options: ReadOptions::default(),
            read_info: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Whether a remote read handle is outstanding
    pub fn is_opened(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the children list reflects a completed read
    pub fn is_initialized(&self) -> bool {
        matches!(self.state, NodeState::Populated | NodeState::Closed)
    }

    /// Children from the last read, plus nodes moved or created here since
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn read_options(&self) -> &ReadOptions {
        &self.read_options
    }

    pub fn read_info(&self) -> Option<ReadInfo> {
        self.read_info
    }

    /// Drop back to `Unopened`; the caller has closed any handle
    pub(crate) fn invalidate(&mut self) {
        self.state = NodeState::Unopened;
    }
}

impl CatalogObject for Collection {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Collection
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// Payload of a tree node
#[derive(Debug, Clone)]
pub enum NodeItem {
    Collection(Collection),
    DataObject(DataObject),
}

/// Represents a node in the collection tree
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Unique identifier
    pub id: NodeId,
    /// Parent collection, if it has been materialized
    pub parent: Option<NodeId>,
    pub item: NodeItem,
    /// Created on first metadata access
    pub(crate) meta: Option<MetaCollection>,
}

impl TreeNode {
    pub fn new(id: NodeId, item: NodeItem, parent: Option<NodeId>) -> Self {
        Self {
            id,
            parent,
            item,
            meta: None,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.item, NodeItem::Collection(_))
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match &self.item {
            NodeItem::Collection(c) => Some(c),
            NodeItem::DataObject(_) => None,
        }
    }

    pub fn as_collection_mut(&mut self) -> Option<&mut Collection> {
        match &mut self.item {
            NodeItem::Collection(c) => Some(c),
            NodeItem::DataObject(_) => None,
        }
    }

    pub fn as_data_object(&self) -> Option<&DataObject> {
        match &self.item {
            NodeItem::DataObject(d) => Some(d),
            NodeItem::Collection(_) => None,
        }
    }

    pub(crate) fn set_path(&mut self, path: String) {
        let name = crate::model::object::base_name(&path).to_string();
        match &mut self.item {
            NodeItem::Collection(c) => {
                c.path = path;
                c.name = name;
            }
            NodeItem::DataObject(d) => {
                d.path = path;
                d.name = name;
            }
        }
        if let Some(meta) = self.meta.as_mut() {
            meta.set_path(self.item.path());
        }
    }
}

impl CatalogObject for NodeItem {
    fn kind(&self) -> ObjectKind {
        match self {
            NodeItem::Collection(c) => c.kind(),
            NodeItem::DataObject(d) => d.kind(),
        }
    }

    fn name(&self) -> &str {
        match self {
            NodeItem::Collection(c) => &c.name,
            NodeItem::DataObject(d) => &d.name,
        }
    }

    fn path(&self) -> &str {
        match self {
            NodeItem::Collection(c) => &c.path,
            NodeItem::DataObject(d) => &d.path,
        }
    }
}

impl CatalogObject for TreeNode {
    fn kind(&self) -> ObjectKind {
        self.item.kind()
    }

    fn name(&self) -> &str {
        self.item.name()
    }

    fn path(&self) -> &str {
        self.item.path()
    }
}
