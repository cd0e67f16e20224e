// Catalog client library - session pool, entity caches and the collection tree

pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod services;
pub mod tree;

pub use config::{CollectionOptions, ConnectionOptions, Environment};
pub use connection::{Connection, UserRef};
pub use error::{CatalogError, CatalogResult, RemoteError};
pub use tree::{CollectionTree, Destination, NodeId, NodeState, ReadInfo, ReadOptions, ReadWindow};
