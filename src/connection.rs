//! Entry point to a catalog: one session pool plus the caches built on it
//!
//! A `Connection` is shared behind an `Arc` by every tree opened from it.
//! Any number of tasks may use one connection at a time; each remote call
//! holds exactly one pooled session.

use crate::config::{CollectionOptions, ConnectionOptions};
use crate::error::{CatalogError, CatalogResult};
use crate::model::acl::AclResolver;
use crate::model::entity::{EntityCache, Group, User};
use crate::model::object::ObjectKind;
use crate::services::catalog::backend::{CatalogBackend, ObjStat};
use crate::services::catalog::pool::SessionPool;
use crate::tree::node::Collection;
use crate::tree::CollectionTree;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A user given either by name or as an already resolved entity
#[derive(Debug, Clone)]
pub enum UserRef {
    Name(String),
    User(Arc<User>),
}

impl From<&str> for UserRef {
    fn from(name: &str) -> Self {
        UserRef::Name(name.to_string())
    }
}

impl From<Arc<User>> for UserRef {
    fn from(user: Arc<User>) -> Self {
        UserRef::User(user)
    }
}

pub struct Connection {
    options: ConnectionOptions,
    pool: SessionPool,
    entities: EntityCache,
    acl: AclResolver,
    stat_cache: Mutex<LruCache<String, ObjStat>>,
    connected: AtomicBool,
}

impl Connection {
    /// Validate `options` and open the first session
    ///
    /// Fails with `Remote { op: "connect", .. }` when the catalog rejects
    /// the credentials.
    pub async fn connect(
        options: ConnectionOptions,
        backend: Arc<dyn CatalogBackend>,
    ) -> CatalogResult<Arc<Self>> {
        let options = options.resolve()?;
        let pool = SessionPool::new(backend, options.credentials(), options.pool_size);
        pool.warm_up().await?;

        let capacity = NonZeroUsize::new(options.stat_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let conn = Self {
            acl: AclResolver::new(options.lenient_access_levels),
            options,
            pool,
            entities: EntityCache::new(),
            stat_cache: Mutex::new(LruCache::new(capacity)),
            connected: AtomicBool::new(true),
        };
        tracing::info!(%conn, "connected");
        Ok(Arc::new(conn))
    }

    /// Close every idle session; sessions still borrowed close on return
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pool.close().await;
        tracing::info!(host = %self.options.host, zone = %self.options.zone, "disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn entities(&self) -> &EntityCache {
        &self.entities
    }

    pub fn acl_resolver(&self) -> AclResolver {
        self.acl
    }

    pub fn zone(&self) -> &str {
        &self.options.zone
    }

    pub fn username(&self) -> &str {
        &self.options.username
    }

    /// Stat `path`, answering from the LRU cache unless `skip_cache` is set
    pub async fn stat(&self, path: &str, skip_cache: bool) -> CatalogResult<ObjStat> {
        if !skip_cache {
            if let Some(stat) = self.cached_stat(path) {
                return Ok(stat);
            }
        }

        let stat = {
            let session = self.pool.acquire().await?;
            session
                .backend()
                .stat_object(session.session(), path)
                .await
                .map_err(|e| CatalogError::remote("stat", path, e))?
        };
        self.lock_stats().put(path.to_string(), stat.clone());
        Ok(stat)
    }

    fn cached_stat(&self, path: &str) -> Option<ObjStat> {
        self.lock_stats().get(path).cloned()
    }

    fn lock_stats(&self) -> MutexGuard<'_, LruCache<String, ObjStat>> {
        self.stat_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop cached stats for `path` and everything below it
    pub fn forget_stat(&self, path: &str) {
        let mut cache = self.lock_stats();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let stale: Vec<String> = cache
            .iter()
            .map(|(key, _)| key)
            .filter(|key| key.as_str() == path || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    /// Open a collection as the root of a new tree
    ///
    /// With `recursive` the whole subtree is read before this returns;
    /// otherwise only the remote handle is opened.
    pub async fn collection(self: &Arc<Self>, options: CollectionOptions) -> CatalogResult<CollectionTree> {
        let path = match options.path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        let mut root = self
            .collection_node(path, options.recursive, !options.fetch_replicas, options.skip_cache)
            .await?;
        root.read_options = options.read;

        let mut tree = CollectionTree::new(Arc::clone(self), root);
        let root_id = tree.root_id();
        if options.recursive {
            tree.init(root_id).await?;
        } else {
            tree.open(root_id).await?;
        }
        Ok(tree)
    }

    /// Collection record for `path` with its owner resolved
    pub(crate) async fn collection_node(
        &self,
        path: &str,
        recursive: bool,
        trim_replicas: bool,
        skip_cache: bool,
    ) -> CatalogResult<Collection> {
        let stat = self.stat(path, skip_cache).await?;
        if stat.kind != ObjectKind::Collection {
            return Err(CatalogError::NotACollection(path.to_string()));
        }
        let owner = self.entities.resolve_user(&self.pool, &stat.owner_name).await?;

        let mut col = Collection::new(path, recursive, trim_replicas);
        col.owner_name = stat.owner_name;
        col.owner = Some(owner);
        col.create_time = stat.create_time;
        col.modify_time = stat.modify_time;
        Ok(col)
    }

    /// Every user of the zone, sorted by name
    pub async fn users(&self) -> CatalogResult<Vec<Arc<User>>> {
        self.entities.users(&self.pool).await
    }

    /// Every group of the zone, sorted by name
    pub async fn groups(&self) -> CatalogResult<Vec<Arc<Group>>> {
        self.entities.groups(&self.pool).await
    }

    pub async fn user(&self, name: &str) -> CatalogResult<Arc<User>> {
        self.entities.resolve_user(&self.pool, name).await
    }

    pub async fn group(&self, name: &str) -> CatalogResult<Arc<Group>> {
        self.entities.resolve_group(&self.pool, name).await
    }

    /// Add a user to a group and return the group with fresh membership
    pub async fn add_user_to_group(
        &self,
        user: impl Into<UserRef>,
        group: &str,
    ) -> CatalogResult<Arc<Group>> {
        let user = match user.into() {
            UserRef::User(user) => user,
            UserRef::Name(name) => self.user(&name).await?,
        };

        {
            let session = self.pool.acquire().await?;
            session
                .backend()
                .add_user_to_group(session.session(), &user.name, &user.zone, group)
                .await
                .map_err(|e| CatalogError::remote("add user to group", group, e))?;
        }
        tracing::info!(user = %user, group, "added user to group");
        self.entities.refresh_group(&self.pool, group).await
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_connected() {
            "connected"
        } else {
            "disconnected"
        };
        write!(
            f,
            "{}@{}:{} ({}, {})",
            self.options.username, self.options.host, self.options.port, self.options.zone, state
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.options.host)
            .field("port", &self.options.port)
            .field("zone", &self.options.zone)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::memory::MemoryCatalog;
    use crate::services::catalog::slow::{RemoteOp, SlowCatalogBackend, SlowCatalogConfig};

    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new("tempZone");
        catalog
            .add_user("alice", ObjectKind::User)
            .add_data_object("/tempZone/home/alice/a.txt", "alice", 10);
        catalog
    }

    #[tokio::test]
    async fn test_connect_validates_options() {
        let result =
            Connection::connect(ConnectionOptions::default(), Arc::new(catalog())).await;
        assert!(matches!(result, Err(CatalogError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_user() {
        let result = Connection::connect(
            ConnectionOptions::new("mallory", "tempZone"),
            Arc::new(catalog()),
        )
        .await;
        assert!(matches!(
            result,
            Err(CatalogError::Remote { op: "connect", .. })
        ));
    }

    #[tokio::test]
    async fn test_stat_cache_and_skip() {
        let backend = Arc::new(SlowCatalogBackend::new(Arc::new(catalog()), SlowCatalogConfig::none()));
        let conn = Connection::connect(ConnectionOptions::new("rods", "tempZone"), backend.clone())
            .await
            .unwrap();

        let path = "/tempZone/home/alice/a.txt";
        let first = conn.stat(path, false).await.unwrap();
        let second = conn.stat(path, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, 10);
        assert_eq!(backend.metrics().await.calls(RemoteOp::StatObject), 1);

        conn.stat(path, true).await.unwrap();
        assert_eq!(backend.metrics().await.calls(RemoteOp::StatObject), 2);

        conn.forget_stat("/tempZone/home/alice");
        conn.stat(path, false).await.unwrap();
        assert_eq!(backend.metrics().await.calls(RemoteOp::StatObject), 3);
    }

    #[tokio::test]
    async fn test_stat_cache_survives_poisoned_lock() {
        let backend = Arc::new(SlowCatalogBackend::new(Arc::new(catalog()), SlowCatalogConfig::none()));
        let conn = Connection::connect(ConnectionOptions::new("rods", "tempZone"), backend.clone())
            .await
            .unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = conn.stat_cache.lock().unwrap();
            panic!("panic while holding the stat cache");
        }));
        assert!(panicked.is_err());
        assert!(conn.stat_cache.is_poisoned());

        let path = "/tempZone/home/alice/a.txt";
        conn.stat(path, false).await.unwrap();
        conn.stat(path, false).await.unwrap();
        assert_eq!(backend.metrics().await.calls(RemoteOp::StatObject), 1);

        conn.forget_stat(path);
        conn.stat(path, false).await.unwrap();
        assert_eq!(backend.metrics().await.calls(RemoteOp::StatObject), 2);
    }

    #[tokio::test]
    async fn test_collection_rejects_data_object() {
        let conn = Connection::connect(ConnectionOptions::new("rods", "tempZone"), Arc::new(catalog()))
            .await
            .unwrap();
        let result = conn
            .collection(CollectionOptions::new("/tempZone/home/alice/a.txt"))
            .await;
        assert!(matches!(result, Err(CatalogError::NotACollection(_))));
    }

    #[tokio::test]
    async fn test_add_user_to_group_refreshes_membership() {
        let catalog = catalog();
        catalog.add_group("lab", &[]);
        let conn = Connection::connect(ConnectionOptions::new("rods", "tempZone"), Arc::new(catalog))
            .await
            .unwrap();

        assert!(!conn.group("lab").await.unwrap().has_member("alice"));
        let group = conn.add_user_to_group("alice", "lab").await.unwrap();
        assert!(group.has_member("alice"));
        assert!(conn.group("lab").await.unwrap().has_member("alice"));
    }

    #[tokio::test]
    async fn test_display_and_disconnect() {
        let conn = Connection::connect(ConnectionOptions::new("rods", "tempZone"), Arc::new(catalog()))
            .await
            .unwrap();
        assert_eq!(conn.to_string(), "rods@localhost:1247 (tempZone, connected)");
        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert!(conn.to_string().ends_with("disconnected)"));
    }
}
