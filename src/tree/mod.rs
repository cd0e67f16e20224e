//! Lazily populated collection tree
//!
//! - `node`: arena node types and the per-collection state machine
//! - `reader`: paged and full reads of a collection listing
//! - `tree`: the arena itself, lookups and (re)population
//! - `ops`: move, copy, replica walks, removal, permissions, metadata

pub mod node;
pub mod ops;
pub mod reader;
#[allow(clippy::module_inception)]
pub mod tree;

pub use node::{Collection, NodeId, NodeItem, NodeState, TreeNode};
pub use ops::Destination;
pub use reader::{PagedCollectionReader, ReadFilter, ReadInfo, ReadOptions, ReadPage, ReadWindow};
pub use tree::{CollectionTree, Listing};
