//! Lazily loaded attribute-value-unit metadata of one catalog object

use crate::error::{CatalogError, CatalogResult};
use crate::model::object::ObjectKind;
use crate::services::catalog::backend::Avu;
use crate::services::catalog::pool::SessionPool;

/// AVU triples attached to a collection or data object
///
/// Nothing is fetched until the first read. Adding or deleting through this
/// handle updates the local copy after the remote call succeeds.
#[derive(Debug, Clone)]
pub struct MetaCollection {
    path: String,
    kind: ObjectKind,
    avus: Option<Vec<Avu>>,
}

impl MetaCollection {
    pub fn new(path: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            path: path.into(),
            kind,
            avus: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.avus.is_some()
    }

    /// Re-point the handle after its owner moved; forces a reload
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
        self.avus = None;
    }

    /// Every AVU on the object
    pub async fn all(&mut self, pool: &SessionPool) -> CatalogResult<&[Avu]> {
        if self.avus.is_none() {
            self.refresh(pool).await?;
        }
        Ok(self.avus.as_deref().unwrap_or_default())
    }

    /// AVUs whose attribute equals `name`
    pub async fn attribute(&mut self, pool: &SessionPool, name: &str) -> CatalogResult<Vec<Avu>> {
        let avus = self.all(pool).await?;
        Ok(avus.iter().filter(|a| a.attribute == name).cloned().collect())
    }

    pub async fn add(&mut self, pool: &SessionPool, avu: Avu) -> CatalogResult<()> {
        let session = pool.acquire().await?;
        session
            .backend()
            .add_metadata(session.session(), &self.path, self.kind, &avu)
            .await
            .map_err(|e| CatalogError::remote("add metadata", self.path.as_str(), e))?;
        drop(session);

        if let Some(avus) = self.avus.as_mut() {
            avus.push(avu);
        }
        Ok(())
    }

    pub async fn delete(&mut self, pool: &SessionPool, avu: &Avu) -> CatalogResult<()> {
        let session = pool.acquire().await?;
        session
            .backend()
            .remove_metadata(session.session(), &self.path, self.kind, avu)
            .await
            .map_err(|e| CatalogError::remote("remove metadata", self.path.as_str(), e))?;
        drop(session);

        if let Some(avus) = self.avus.as_mut() {
            avus.retain(|a| a != avu);
        }
        Ok(())
    }

    pub async fn refresh(&mut self, pool: &SessionPool) -> CatalogResult<()> {
        let session = pool.acquire().await?;
        let avus = session
            .backend()
            .list_metadata(session.session(), &self.path, self.kind)
            .await
            .map_err(|e| CatalogError::remote("list metadata", self.path.as_str(), e))?;
        self.avus = Some(avus);
        Ok(())
    }
}
