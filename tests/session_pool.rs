// Session pool accounting under failures, contention and shutdown

mod common;

use common::fixtures::{connect, instrumented, sample_catalog, HOME};
use rods_catalog::error::RemoteError;
use rods_catalog::services::catalog::{
    CatalogBackend, RemoteOp, SlowCatalogBackend, SlowCatalogConfig,
};
use rods_catalog::{CatalogError, CollectionOptions, Connection, NodeState};
use std::sync::Arc;
use std::time::Duration;

const SYS_INTERNAL: i32 = -154000;

fn assert_pool_balanced(conn: &Connection) {
    let stats = conn.pool().stats();
    assert_eq!(stats.in_use, 0, "sessions still lent: {stats:?}");
    assert_eq!(stats.acquisitions, stats.releases);
    assert!(stats.open <= stats.max_size);
}

#[tokio::test]
async fn test_read_fault_returns_sessions_and_handle() {
    common::tracing::init_tracing_from_env();
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    assert_eq!(catalog.open_handle_count(), 1);

    backend
        .inject_fault(
            RemoteOp::ReadCollectionEntry,
            RemoteError::new(SYS_INTERNAL, "lost connection"),
        )
        .await;
    let err = tree.init(root).await.unwrap_err();

    assert!(matches!(err, CatalogError::Remote { .. }));
    assert_eq!(err.remote_status(), Some(SYS_INTERNAL));
    let col = tree.collection(root).unwrap();
    assert_eq!(col.state(), NodeState::Unopened);
    assert!(!col.is_opened());
    assert_eq!(catalog.open_handle_count(), 0);
    assert_pool_balanced(&conn);
}

#[tokio::test]
async fn test_init_retries_after_fault() {
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 1).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();

    backend
        .inject_fault_after(
            RemoteOp::ReadCollectionEntry,
            3,
            RemoteError::new(SYS_INTERNAL, "lost connection"),
        )
        .await;
    assert!(tree.init(root).await.is_err());

    tree.init(root).await.unwrap();
    assert_eq!(tree.collection(root).unwrap().children().len(), 5);
    assert_eq!(tree.collection(root).unwrap().state(), NodeState::Closed);
    assert_eq!(catalog.open_handle_count(), 0);
    assert_pool_balanced(&conn);
}

#[tokio::test]
async fn test_failed_move_leaves_tree_alone() {
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let a = tree.find(root, "a").await.unwrap().unwrap();

    backend
        .inject_fault(RemoteOp::Move, RemoteError::new(SYS_INTERNAL, "refused"))
        .await;
    let result = tree.move_to(a, format!("{HOME}/b")).await;

    assert!(matches!(result, Err(CatalogError::Remote { op: "move", .. })));
    assert_eq!(tree.path(a).unwrap(), format!("{HOME}/a"));
    assert_eq!(tree.node_by_path(&format!("{HOME}/a")), Some(a));
    assert!(catalog.exists(&format!("{HOME}/a")));
    assert_pool_balanced(&conn);
}

#[tokio::test]
async fn test_concurrent_trees_never_exceed_pool() {
    let catalog = sample_catalog();
    let inner: Arc<dyn CatalogBackend> = catalog.clone();
    let backend = Arc::new(SlowCatalogBackend::new(
        inner,
        SlowCatalogConfig::uniform(Duration::from_millis(2)),
    ));
    let conn = connect(backend.clone(), 2).await;

    let open = |path: String| {
        let conn = Arc::clone(&conn);
        async move {
            conn.collection(CollectionOptions::new(path).recursive(true))
                .await
                .map(|tree| tree.len())
        }
    };
    let (home, a, b, inner_col) = tokio::join!(
        open(HOME.to_string()),
        open(format!("{HOME}/a")),
        open(format!("{HOME}/b")),
        open(format!("{HOME}/a/inner")),
    );

    assert_eq!(home.unwrap(), 9);
    assert_eq!(a.unwrap(), 4);
    assert_eq!(b.unwrap(), 1);
    assert_eq!(inner_col.unwrap(), 2);

    let stats = conn.pool().stats();
    assert!(stats.connects <= 2, "opened {} sessions", stats.connects);
    assert!(catalog.session_count() <= 2);
    assert_eq!(backend.metrics().await.calls(RemoteOp::Connect), stats.connects);
    assert_eq!(catalog.open_handle_count(), 0);
    assert_pool_balanced(&conn);
}

#[tokio::test]
async fn test_disconnect_closes_sessions() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 3).await;
    conn.stat(HOME, true).await.unwrap();
    assert!(catalog.session_count() >= 1);

    conn.disconnect().await;

    assert_eq!(catalog.session_count(), 0);
    assert!(conn.pool().is_closed());
    assert!(matches!(
        conn.stat(HOME, true).await,
        Err(CatalogError::PoolClosed)
    ));
}
