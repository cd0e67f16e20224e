//! Catalog backend abstraction layer
//!
//! The client model never talks to the catalog directly: every remote call
//! goes through a session borrowed from the `SessionPool`, which wraps an
//! implementation of `CatalogBackend`.

pub mod backend;
pub mod memory;
pub mod pool;
pub mod slow;

pub use backend::{CatalogBackend, Credentials};
pub use memory::MemoryCatalog;
pub use pool::{PooledSession, PoolStats, SessionPool};
pub use slow::{BackendMetrics, RemoteOp, SlowCatalogBackend, SlowCatalogConfig};
