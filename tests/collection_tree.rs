// Collection tree tests - lazy population, refresh and mutating operations

mod common;

use common::fixtures::{connect, instrumented, sample_catalog, HOME, ZONE};
use rods_catalog::model::object::{CatalogObject, ObjectKind};
use rods_catalog::services::catalog::backend::{Avu, TrimOptions};
use rods_catalog::services::catalog::memory::{CAT_COLLECTION_NOT_EMPTY, MemoryCatalog};
use rods_catalog::services::catalog::RemoteOp;
use rods_catalog::{CatalogError, CollectionOptions, CollectionTree, Destination, NodeId, NodeState};
use std::sync::Arc;

fn names(tree: &CollectionTree, id: NodeId) -> Vec<String> {
    tree.collection(id)
        .unwrap()
        .children()
        .iter()
        .map(|c| tree.node(*c).unwrap().name().to_string())
        .collect()
}

#[tokio::test]
async fn test_init_is_idempotent() {
    common::tracing::init_tracing_from_env();
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    assert_eq!(tree.collection(root).unwrap().state(), NodeState::Opened);

    tree.init(root).await.unwrap();
    let first = tree.collection(root).unwrap().children().to_vec();
    assert_eq!(tree.collection(root).unwrap().state(), NodeState::Closed);

    tree.init(root).await.unwrap();
    let second = tree.collection(root).unwrap().children().to_vec();

    assert_eq!(first, second);
    let metrics = backend.metrics().await;
    assert_eq!(metrics.calls(RemoteOp::OpenCollection), 1);
    assert_eq!(metrics.calls(RemoteOp::CloseCollection), 1);
    assert_eq!(catalog.open_handle_count(), 0);
}

#[tokio::test]
async fn test_children_stay_unopened_without_recursive() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();

    let subs = tree.collections(root).await.unwrap();
    assert_eq!(subs.len(), 2);
    for sub in &subs {
        assert_eq!(tree.collection(*sub).unwrap().state(), NodeState::Unopened);
    }

    let objects = tree.data_objects(root).await.unwrap();
    let x3 = tree.data_object(objects[2]).unwrap();
    assert_eq!(x3.name, "x3.txt");
    assert_eq!(x3.size, 300);
    assert_eq!(x3.owner.as_ref().unwrap().name, "alice");
}

#[tokio::test]
async fn test_refresh_sees_remote_changes() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    tree.init(root).await.unwrap();
    let a = tree.cd(root, "a").await.unwrap().unwrap();

    catalog.add_data_object(&format!("{HOME}/x4.txt"), "u", 400);
    tree.init(root).await.unwrap();
    assert_eq!(names(&tree, root).len(), 5);

    tree.refresh(root).await.unwrap();
    assert_eq!(
        names(&tree, root),
        vec!["a", "b", "x1.txt", "x2.txt", "x3.txt", "x4.txt"]
    );
    // Sub-collection nodes survive a refresh.
    assert_eq!(tree.cd(root, "a").await.unwrap(), Some(a));
}

#[tokio::test]
async fn test_recursive_refresh_rereads_every_level() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn
        .collection(CollectionOptions::new(HOME).recursive(true))
        .await
        .unwrap();
    let root = tree.root_id();
    let a = tree.node_by_path(&format!("{HOME}/a")).unwrap();
    let b = tree.node_by_path(&format!("{HOME}/b")).unwrap();
    let inner = tree.node_by_path(&format!("{HOME}/a/inner")).unwrap();
    assert_eq!(names(&tree, a), vec!["inner", "notes.txt"]);
    assert_eq!(names(&tree, inner), vec!["deep.dat"]);

    catalog
        .add_data_object(&format!("{HOME}/a/new.dat"), "u", 5)
        .add_data_object(&format!("{HOME}/a/inner/deeper.dat"), "u", 6)
        .add_collection(&format!("{HOME}/b/fresh"), "u");
    tree.refresh(root).await.unwrap();

    assert_eq!(tree.node_by_path(&format!("{HOME}/a")), Some(a));
    assert_eq!(tree.node_by_path(&format!("{HOME}/a/inner")), Some(inner));
    assert_eq!(names(&tree, a), vec!["inner", "new.dat", "notes.txt"]);
    assert_eq!(names(&tree, inner), vec!["deep.dat", "deeper.dat"]);
    assert_eq!(names(&tree, b), vec!["fresh"]);
    let fresh = tree.node_by_path(&format!("{HOME}/b/fresh")).unwrap();
    assert!(tree.collection(fresh).unwrap().is_initialized());
    assert_eq!(catalog.open_handle_count(), 0);
}

#[tokio::test]
async fn test_recursive_open_with_single_session() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 1).await;
    let mut tree = conn
        .collection(CollectionOptions::new(HOME).recursive(true))
        .await
        .unwrap();
    let root = tree.root_id();

    let a = tree.node_by_path(&format!("{HOME}/a")).unwrap();
    let inner = tree.node_by_path(&format!("{HOME}/a/inner")).unwrap();
    assert!(tree.collection(a).unwrap().is_initialized());
    assert!(tree.collection(inner).unwrap().is_initialized());
    assert!(tree.node_by_path(&format!("{HOME}/a/inner/deep.dat")).is_some());

    let mut seen = Vec::new();
    tree.walk(root, |_, obj| {
        seen.push(obj.name.clone());
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(seen, vec!["deep.dat", "notes.txt", "x1.txt", "x2.txt", "x3.txt"]);

    let stats = conn.pool().stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.acquisitions, stats.releases);
    assert_eq!(catalog.open_handle_count(), 0);
}

#[tokio::test]
async fn test_find_and_parent() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();

    let deep = tree.find_recursive(root, "a/inner/deep.dat").await.unwrap().unwrap();
    assert_eq!(tree.path(deep).unwrap(), format!("{HOME}/a/inner/deep.dat"));
    assert!(tree.get(root, "a").await.unwrap().is_none());
    assert!(tree.exists(root, "x2.txt").await.unwrap());
    assert!(tree.find_recursive(root, "a/missing").await.unwrap().is_none());

    let parent = tree.parent(root).await.unwrap().unwrap();
    assert_eq!(tree.path(parent).unwrap(), format!("/{ZONE}/home"));
    assert_eq!(tree.collection(parent).unwrap().state(), NodeState::Unopened);
    assert!(tree.exists(parent, "u").await.unwrap());
}

#[tokio::test]
async fn test_listing_format() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn
        .collection(CollectionOptions::new(format!("{HOME}/a")))
        .await
        .unwrap();
    let root = tree.root_id();

    let listing = tree.listing(root).await.unwrap().to_string();
    assert_eq!(
        listing,
        format!("Collection: {HOME}/a\n\tC: inner\n\td: notes.txt\n")
    );
}

fn move_catalog() -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new(ZONE);
    catalog
        .add_data_object(&format!("/{ZONE}/a/col/file.dat"), "rods", 5)
        .add_collection(&format!("/{ZONE}/b"), "rods");
    Arc::new(catalog)
}

#[tokio::test]
async fn test_move_collection() {
    let catalog = move_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn
        .collection(CollectionOptions::new(format!("/{ZONE}/a/col")))
        .await
        .unwrap();
    let col = tree.root_id();
    tree.init(col).await.unwrap();

    tree.move_to(col, format!("/{ZONE}/b/")).await.unwrap();

    let moved = tree.collection(col).unwrap();
    assert_eq!(moved.path, format!("/{ZONE}/b/col"));
    assert!(!moved.is_opened());
    assert_eq!(moved.state(), NodeState::Unopened);
    assert!(catalog.exists(&format!("/{ZONE}/b/col/file.dat")));
    assert!(!catalog.exists(&format!("/{ZONE}/a/col")));

    tree.init(col).await.unwrap();
    let file = tree.get(col, "file.dat").await.unwrap().unwrap();
    assert_eq!(tree.path(file).unwrap(), format!("/{ZONE}/b/col/file.dat"));
    assert_eq!(tree.node_by_path(&format!("/{ZONE}/b/col")), Some(col));
}

#[tokio::test]
async fn test_move_relative_and_into_node() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let x1 = tree.get(root, "x1.txt").await.unwrap().unwrap();
    let b = tree.cd(root, "b").await.unwrap().unwrap();

    // Relative destinations resolve against the source's parent.
    let a = tree.cd(root, "a").await.unwrap().unwrap();
    tree.move_to(a, "b").await.unwrap();
    assert_eq!(tree.path(a).unwrap(), format!("{HOME}/b/a"));
    assert!(catalog.exists(&format!("{HOME}/b/a/notes.txt")));

    tree.move_to(x1, Destination::Node(b)).await.unwrap();
    assert_eq!(tree.path(x1).unwrap(), format!("{HOME}/b/x1.txt"));
    assert!(catalog.exists(&format!("{HOME}/b/x1.txt")));
    assert_eq!(tree.collection(b).unwrap().state(), NodeState::Unopened);

    tree.refresh(root).await.unwrap();
    assert_eq!(names(&tree, root), vec!["b", "x2.txt", "x3.txt"]);
}

#[tokio::test]
async fn test_move_rejects_bad_destination_before_remote_call() {
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let a = tree.cd(root, "a").await.unwrap().unwrap();
    let x1 = tree.get(root, "x1.txt").await.unwrap().unwrap();

    let err = tree.move_to(a, Destination::Node(x1)).await.unwrap_err();
    assert!(matches!(err, CatalogError::InvalidDestination(_)));
    let err = tree.move_to(a, format!("{HOME}/a/inner")).await.unwrap_err();
    assert!(matches!(err, CatalogError::InvalidDestination(_)));
    let err = tree.rename(a, "b/c").await.unwrap_err();
    assert!(matches!(err, CatalogError::InvalidName(_)));
    assert!(err.is_validation());

    assert_eq!(backend.metrics().await.calls(RemoteOp::Move), 0);
}

#[tokio::test]
async fn test_rename_data_object() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let x2 = tree.get(root, "x2.txt").await.unwrap().unwrap();

    tree.rename(x2, "renamed.txt").await.unwrap();

    assert_eq!(tree.node(x2).unwrap().name(), "renamed.txt");
    assert_eq!(tree.node_by_path(&format!("{HOME}/renamed.txt")), Some(x2));
    assert!(catalog.exists(&format!("{HOME}/renamed.txt")));
    assert!(!catalog.exists(&format!("{HOME}/x2.txt")));
}

#[tokio::test]
async fn test_copy_collection_refreshes_copy_once() {
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let a = tree.cd(root, "a").await.unwrap().unwrap();
    let b = tree.cd(root, "b").await.unwrap().unwrap();

    let copy = tree.copy_to(a, Destination::Node(b)).await.unwrap();

    assert_eq!(tree.path(copy).unwrap(), format!("{HOME}/b/a"));
    assert!(catalog.exists(&format!("{HOME}/b/a/notes.txt")));
    assert!(catalog.exists(&format!("{HOME}/b/a/inner/deep.dat")));
    assert!(catalog.exists(&format!("{HOME}/a/notes.txt")));
    assert_eq!(names(&tree, copy), vec!["inner", "notes.txt"]);
    assert_eq!(tree.collection(copy).unwrap().state(), NodeState::Closed);

    let copied_inner = tree.node_by_path(&format!("{HOME}/b/a/inner")).unwrap();
    assert_eq!(
        tree.collection(copied_inner).unwrap().state(),
        NodeState::Unopened
    );
    assert_eq!(backend.metrics().await.calls(RemoteOp::CopyDataObject), 2);
}

#[tokio::test]
async fn test_create_sub_collection_marks_parent_stale() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    tree.init(root).await.unwrap();

    let created = tree.create_sub_collection(root, "c").await.unwrap();

    assert_eq!(tree.path(created).unwrap(), format!("{HOME}/c"));
    assert_eq!(tree.collection(root).unwrap().state(), NodeState::Unopened);
    assert_eq!(tree.collections(root).await.unwrap().len(), 3);
    assert!(tree.collections(root).await.unwrap().contains(&created));
    assert!(matches!(
        tree.create_sub_collection(root, "").await,
        Err(CatalogError::InvalidName(_))
    ));
}

#[tokio::test]
async fn test_replicate_and_trim_with_replica_listing() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn
        .collection(CollectionOptions::new(format!("{HOME}/a")).fetch_replicas(true))
        .await
        .unwrap();
    let root = tree.root_id();
    tree.init(root).await.unwrap();
    assert_eq!(names(&tree, root), vec!["inner", "notes.txt"]);

    tree.replicate(root, "archiveResc").await.unwrap();

    assert_eq!(catalog.replicas(&format!("{HOME}/a/inner/deep.dat")).len(), 2);
    assert_eq!(names(&tree, root), vec!["inner", "notes.txt", "notes.txt"]);
    let objects = tree.data_objects(root).await.unwrap();
    let resources: Vec<String> = objects
        .iter()
        .filter_map(|id| tree.data_object(*id)?.replica.clone())
        .map(|r| r.resource)
        .collect();
    assert_eq!(resources, vec!["demoResc", "archiveResc"]);

    // A second replicate onto the same resource fails; backup does not.
    assert!(tree.replicate(root, "archiveResc").await.is_err());
    tree.backup(root, "archiveResc").await.unwrap();

    tree.trim(
        root,
        TrimOptions {
            resource: Some("archiveResc".to_string()),
            min_copies: 1,
            min_age_minutes: 0,
        },
    )
    .await
    .unwrap();
    assert_eq!(names(&tree, root), vec!["inner", "notes.txt"]);
    assert_eq!(catalog.replicas(&format!("{HOME}/a/notes.txt")).len(), 1);
}

#[tokio::test]
async fn test_replica_walk_skips_refresh_when_trimmed() {
    let catalog = sample_catalog();
    let backend = instrumented(&catalog);
    let conn = connect(backend.clone(), 2).await;
    let mut tree = conn
        .collection(CollectionOptions::new(format!("{HOME}/a")).recursive(true))
        .await
        .unwrap();
    let root = tree.root_id();
    let opens = backend.metrics().await.calls(RemoteOp::OpenCollection);

    tree.replicate(root, "archiveResc").await.unwrap();

    let metrics = backend.metrics().await;
    assert_eq!(metrics.calls(RemoteOp::OpenCollection), opens);
    assert_eq!(metrics.calls(RemoteOp::Replicate), 2);
    assert_eq!(catalog.replicas(&format!("{HOME}/a/notes.txt")).len(), 2);

    // Physical moves always rebuild listings.
    tree.move_to_resource(root, "demoResc").await.unwrap_err();
    catalog.add_resource("tapeResc");
    tree.move_to_resource(root, "tapeResc").await.unwrap();
    assert_eq!(
        backend.metrics().await.calls(RemoteOp::OpenCollection),
        opens + 2
    );
}

#[tokio::test]
async fn test_trash_and_delete() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let a = tree.cd(root, "a").await.unwrap().unwrap();
    let x1 = tree.get(root, "x1.txt").await.unwrap().unwrap();

    let err = tree.delete(a, false).await.unwrap_err();
    assert_eq!(err.remote_status(), Some(CAT_COLLECTION_NOT_EMPTY));
    assert!(tree.node(a).is_some());

    tree.trash(x1, false).await.unwrap();
    assert!(tree.node(x1).is_none());
    assert!(catalog.exists("/tempZone/trash/home/rods/x1.txt"));
    assert_eq!(tree.collection(root).unwrap().state(), NodeState::Unopened);

    tree.destroy(a).await.unwrap();
    assert!(!catalog.exists(&format!("{HOME}/a")));
    assert!(matches!(
        tree.collection(a),
        Err(CatalogError::NodeNotFound(_))
    ));
    assert_eq!(names(&tree, root), vec!["b", "x2.txt", "x3.txt"]);
    assert_eq!(tree.collections(root).await.unwrap().len(), 1);

    let mut trash = conn
        .collection(CollectionOptions::new("/tempZone/trash/home/rods"))
        .await
        .unwrap();
    let trash_root = trash.root_id();
    let trashed = trash.get(trash_root, "x1.txt").await.unwrap().unwrap();
    trash.rm_trash(trashed).await.unwrap();
    assert!(!catalog.exists("/tempZone/trash/home/rods/x1.txt"));
}

#[tokio::test]
async fn test_metadata_round() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;
    let mut tree = conn.collection(CollectionOptions::new(HOME)).await.unwrap();
    let root = tree.root_id();
    let x1 = tree.get(root, "x1.txt").await.unwrap().unwrap();

    tree.add_meta(x1, Avu::new("project", "alpha", "")).await.unwrap();
    tree.add_meta(x1, Avu::new("project", "beta", "")).await.unwrap();
    tree.add_meta(x1, Avu::new("size", "12", "GB")).await.unwrap();
    assert_eq!(tree.attribute(x1, "project").await.unwrap().len(), 2);

    tree.delete_meta(x1, "project").await.unwrap();
    assert!(tree.attribute(x1, "project").await.unwrap().is_empty());

    let meta = tree.meta(x1).await.unwrap();
    meta.refresh(conn.pool()).await.unwrap();
    assert_eq!(meta.all(conn.pool()).await.unwrap(), &[Avu::new("size", "12", "GB")]);
    assert_eq!(tree.node(x1).unwrap().kind(), ObjectKind::DataObject);
}

#[tokio::test]
async fn test_concurrent_trees_share_connection() {
    let catalog = sample_catalog();
    let conn = connect(catalog.clone(), 2).await;

    let (a, b) = tokio::join!(
        conn.collection(CollectionOptions::new(format!("{HOME}/a")).recursive(true)),
        conn.collection(CollectionOptions::new(HOME).recursive(true)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.len(), 4);
    assert!(b.node_by_path(&format!("{HOME}/a/inner/deep.dat")).is_some());
    assert_eq!(conn.pool().stats().in_use, 0);
    assert_eq!(catalog.open_handle_count(), 0);
}
