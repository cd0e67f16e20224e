//! Error types for catalog operations.

use crate::config::ConfigError;
use crate::model::entity::EntityKind;
use crate::tree::node::NodeId;
use thiserror::Error;

/// Result type alias for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Status reported by the remote catalog for a failed call.
///
/// Backends return this for every non-zero status. The caller wraps it
/// with the operation name and the path it was acting on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("status {status}: {message}")]
pub struct RemoteError {
    pub status: i32,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Errors that can occur while talking to or modelling the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A remote call returned a non-zero status.
    #[error("{op} failed for {path}: {source}")]
    Remote {
        op: &'static str,
        path: String,
        #[source]
        source: RemoteError,
    },

    /// A user or group referenced by the catalog is missing from the entity cache.
    #[error("{kind} '{name}' not found in entity cache")]
    CacheDesync { kind: EntityKind, name: String },

    /// Subject or object kind string that maps to no known kind.
    #[error("unknown object kind: {0}")]
    UnknownKind(String),

    /// Access level string that maps to no known level.
    #[error("unknown access level: {0}")]
    UnknownAccessLevel(String),

    /// Destination argument of a move or copy is unusable.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// New name for a rename contains a path separator or is empty.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The node is a data object where a collection is required.
    #[error("not a collection: {0}")]
    NotACollection(String),

    /// The node id does not exist in this tree.
    #[error("{0} not found in tree")]
    NodeNotFound(NodeId),

    /// The session pool was closed while waiting for a session.
    #[error("session pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CatalogError {
    /// Wrap a remote failure with the operation and path it belongs to.
    pub fn remote(op: &'static str, path: impl Into<String>, source: RemoteError) -> Self {
        CatalogError::Remote {
            op,
            path: path.into(),
            source,
        }
    }

    /// Remote status code, if this error came from the catalog.
    pub fn remote_status(&self) -> Option<i32> {
        match self {
            CatalogError::Remote { source, .. } => Some(source.status),
            _ => None,
        }
    }

    /// Whether this error was raised before any remote call was issued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CatalogError::InvalidDestination(_)
                | CatalogError::InvalidName(_)
                | CatalogError::NotACollection(_)
                | CatalogError::NodeNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_includes_op_and_path() {
        let err = CatalogError::remote(
            "open collection",
            "/tempZone/home/rods",
            RemoteError::new(-808000, "CAT_NO_ROWS_FOUND"),
        );

        let msg = err.to_string();
        assert!(msg.contains("open collection"));
        assert!(msg.contains("/tempZone/home/rods"));
        assert!(msg.contains("-808000"));
        assert_eq!(err.remote_status(), Some(-808000));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_validation_errors() {
        assert!(CatalogError::InvalidName("a/b".to_string()).is_validation());
        assert!(CatalogError::InvalidDestination(String::new()).is_validation());
        assert!(!CatalogError::PoolClosed.is_validation());
        assert_eq!(CatalogError::PoolClosed.remote_status(), None);
    }
}
