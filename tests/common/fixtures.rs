// Catalog fixtures

use rods_catalog::model::object::ObjectKind;
use rods_catalog::services::catalog::{
    CatalogBackend, MemoryCatalog, SlowCatalogBackend, SlowCatalogConfig,
};
use rods_catalog::{Connection, ConnectionOptions};
use std::sync::Arc;

pub const ZONE: &str = "tempZone";
pub const HOME: &str = "/tempZone/home/u";

/// `/tempZone/home/u` with sub-collections `a`, `b` and data objects `x1`..`x3`
///
/// `a` holds `a/inner/deep.dat` and `a/notes.txt`; `b` is empty.
pub fn sample_catalog() -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new(ZONE);
    catalog
        .add_user("u", ObjectKind::User)
        .add_user("alice", ObjectKind::User)
        .add_group("lab", &["u"])
        .add_resource("archiveResc")
        .add_collection(&format!("{HOME}/a"), "u")
        .add_collection(&format!("{HOME}/b"), "u")
        .add_data_object(&format!("{HOME}/x1.txt"), "u", 100)
        .add_data_object(&format!("{HOME}/x2.txt"), "u", 200)
        .add_data_object(&format!("{HOME}/x3.txt"), "alice", 300)
        .add_data_object(&format!("{HOME}/a/notes.txt"), "u", 10)
        .add_data_object(&format!("{HOME}/a/inner/deep.dat"), "u", 20);
    Arc::new(catalog)
}

/// Wrap a catalog so every remote call is counted
pub fn instrumented(catalog: &Arc<MemoryCatalog>) -> Arc<SlowCatalogBackend> {
    let inner: Arc<dyn CatalogBackend> = catalog.clone();
    Arc::new(SlowCatalogBackend::new(inner, SlowCatalogConfig::none()))
}

/// Connect as `rods` with a pool of `pool_size` sessions
pub async fn connect(backend: Arc<dyn CatalogBackend>, pool_size: usize) -> Arc<Connection> {
    let mut options = ConnectionOptions::new("rods", ZONE);
    options.pool_size = pool_size;
    Connection::connect(options, backend)
        .await
        .expect("connect to test catalog")
}
