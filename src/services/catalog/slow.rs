//! Slow catalog backend for testing
//!
//! This module provides a decorator around any CatalogBackend that adds
//! configurable delays to simulate a distant catalog server, counts every
//! remote call, and can fail a chosen call on demand. Tests use the counts
//! to assert which RPCs a code path issued.

use super::backend::{
    Avu, CatalogBackend, CollEntry, CollectionHandle, Credentials, EntryStream, MoveKind, ObjStat,
    QueryWindow, RawAcl, RemoveOptions, Session, TrimOptions,
};
use crate::error::RemoteError;
use crate::model::acl::AccessLevel;
use crate::model::object::ObjectKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Every call on the backend surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Connect,
    Disconnect,
    OpenCollection,
    ReadCollectionEntry,
    CloseCollection,
    StatObject,
    GetAcl,
    Chmod,
    GetInheritance,
    SetInheritance,
    Remove,
    Move,
    CreateCollection,
    CopyDataObject,
    TrimReplicas,
    Replicate,
    MoveToResource,
    ListUsers,
    ListGroups,
    GetUserInfo,
    GetGroupMembers,
    AddUserToGroup,
    ListMetadata,
    AddMetadata,
    RemoveMetadata,
}

/// Configuration for slow catalog simulation
#[derive(Debug, Clone)]
pub struct SlowCatalogConfig {
    /// Delay for connect
    pub connect_delay: Duration,
    /// Delay for each collection row read
    pub read_delay: Duration,
    /// Delay for every other call
    pub call_delay: Duration,
}

impl SlowCatalogConfig {
    /// Create a config with uniform delay for all operations
    pub fn uniform(delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            read_delay: delay,
            call_delay: delay,
        }
    }

    /// Create a config with no delays (useful when only metrics matter)
    pub fn none() -> Self {
        Self::uniform(Duration::ZERO)
    }

    /// Create a config simulating a catalog across a slow network
    pub fn slow_network() -> Self {
        Self {
            connect_delay: Duration::from_millis(300),
            read_delay: Duration::from_millis(5),
            call_delay: Duration::from_millis(50),
        }
    }

    fn delay_for(&self, op: RemoteOp) -> Duration {
        match op {
            RemoteOp::Connect => self.connect_delay,
            RemoteOp::ReadCollectionEntry => self.read_delay,
            _ => self.call_delay,
        }
    }
}

impl Default for SlowCatalogConfig {
    fn default() -> Self {
        Self::none()
    }
}

/// Metrics tracking for catalog calls
#[derive(Debug, Clone, Default)]
pub struct BackendMetrics {
    calls: HashMap<RemoteOp, usize>,
    entry_reads: HashMap<EntryStream, usize>,
    /// Total time spent in artificial delays
    pub total_delay_time: Duration,
}

impl BackendMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all metrics to zero
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of calls of one kind
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of row reads issued against one stream
    pub fn entry_reads(&self, stream: EntryStream) -> usize {
        self.entry_reads.get(&stream).copied().unwrap_or(0)
    }

    /// Get total number of catalog calls
    pub fn total_calls(&self) -> usize {
        self.calls.values().sum()
    }
}

#[derive(Debug)]
struct Fault {
    /// Matching calls to let through before failing
    skip: usize,
    error: RemoteError,
}

/// Slow catalog backend wrapper for testing
///
/// Wraps any CatalogBackend implementation and adds configurable delays to
/// each operation. Also tracks metrics about operation counts and timing.
pub struct SlowCatalogBackend {
    /// The underlying real backend
    inner: Arc<dyn CatalogBackend>,
    /// Configuration for delays
    config: SlowCatalogConfig,
    /// Metrics tracking
    metrics: Arc<Mutex<BackendMetrics>>,
    /// One-shot failures keyed by call
    faults: Mutex<HashMap<RemoteOp, Fault>>,
}

impl SlowCatalogBackend {
    /// Create a new slow catalog backend
    pub fn new(inner: Arc<dyn CatalogBackend>, config: SlowCatalogConfig) -> Self {
        Self {
            inner,
            config,
            metrics: Arc::new(Mutex::new(BackendMetrics::new())),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Create with default (no delay) config
    pub fn with_default_config(inner: Arc<dyn CatalogBackend>) -> Self {
        Self::new(inner, SlowCatalogConfig::default())
    }

    /// Get a snapshot of current metrics
    pub async fn metrics(&self) -> BackendMetrics {
        self.metrics.lock().await.clone()
    }

    /// Reset metrics to zero
    pub async fn reset_metrics(&self) {
        self.metrics.lock().await.reset();
    }

    /// Get a reference to the metrics Arc (for sharing)
    pub fn metrics_arc(&self) -> Arc<Mutex<BackendMetrics>> {
        self.metrics.clone()
    }

    /// Fail the next call of `op` with `error`
    pub async fn inject_fault(&self, op: RemoteOp, error: RemoteError) {
        self.inject_fault_after(op, 0, error).await;
    }

    /// Let `skip` calls of `op` succeed, then fail the next one with `error`
    pub async fn inject_fault_after(&self, op: RemoteOp, skip: usize, error: RemoteError) {
        self.faults.lock().await.insert(op, Fault { skip, error });
    }

    async fn call(&self, op: RemoteOp) -> Result<(), RemoteError> {
        let delay = self.config.delay_for(op);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut metrics = self.metrics.lock().await;
            *metrics.calls.entry(op).or_default() += 1;
            metrics.total_delay_time += delay;
        }

        let mut faults = self.faults.lock().await;
        match faults.get_mut(&op) {
            Some(fault) if fault.skip > 0 => {
                fault.skip -= 1;
                Ok(())
            }
            Some(_) => match faults.remove(&op) {
                Some(fault) => Err(fault.error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CatalogBackend for SlowCatalogBackend {
    async fn connect(&self, credentials: &Credentials) -> Result<Session, RemoteError> {
        self.call(RemoteOp::Connect).await?;
        self.inner.connect(credentials).await
    }

    async fn disconnect(&self, session: Session) -> Result<(), RemoteError> {
        self.call(RemoteOp::Disconnect).await?;
        self.inner.disconnect(session).await
    }

    async fn open_collection(
        &self,
        session: &Session,
        path: &str,
        trim_replicas: bool,
    ) -> Result<CollectionHandle, RemoteError> {
        self.call(RemoteOp::OpenCollection).await?;
        self.inner.open_collection(session, path, trim_replicas).await
    }

    async fn read_collection_entry(
        &self,
        session: &Session,
        handle: &mut CollectionHandle,
        stream: EntryStream,
        window: QueryWindow,
    ) -> Result<Option<CollEntry>, RemoteError> {
        self.call(RemoteOp::ReadCollectionEntry).await?;
        *self
            .metrics
            .lock()
            .await
            .entry_reads
            .entry(stream)
            .or_default() += 1;
        self.inner
            .read_collection_entry(session, handle, stream, window)
            .await
    }

    async fn close_collection(
        &self,
        session: &Session,
        handle: CollectionHandle,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::CloseCollection).await?;
        self.inner.close_collection(session, handle).await
    }

    async fn stat_object(&self, session: &Session, path: &str) -> Result<ObjStat, RemoteError> {
        self.call(RemoteOp::StatObject).await?;
        self.inner.stat_object(session, path).await
    }

    async fn get_acl(
        &self,
        session: &Session,
        path: &str,
        zone_hint: &str,
    ) -> Result<Vec<RawAcl>, RemoteError> {
        self.call(RemoteOp::GetAcl).await?;
        self.inner.get_acl(session, path, zone_hint).await
    }

    async fn chmod(
        &self,
        session: &Session,
        path: &str,
        subject: &str,
        zone: &str,
        level: AccessLevel,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::Chmod).await?;
        self.inner
            .chmod(session, path, subject, zone, level, recursive)
            .await
    }

    async fn get_inheritance(&self, session: &Session, path: &str) -> Result<bool, RemoteError> {
        self.call(RemoteOp::GetInheritance).await?;
        self.inner.get_inheritance(session, path).await
    }

    async fn set_inheritance(
        &self,
        session: &Session,
        path: &str,
        inherit: bool,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::SetInheritance).await?;
        self.inner
            .set_inheritance(session, path, inherit, recursive)
            .await
    }

    async fn remove(
        &self,
        session: &Session,
        path: &str,
        options: RemoveOptions,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::Remove).await?;
        self.inner.remove(session, path, options).await
    }

    async fn move_object(
        &self,
        session: &Session,
        src: &str,
        dst: &str,
        kind: MoveKind,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::Move).await?;
        self.inner.move_object(session, src, dst, kind).await
    }

    async fn create_collection(&self, session: &Session, path: &str) -> Result<(), RemoteError> {
        self.call(RemoteOp::CreateCollection).await?;
        self.inner.create_collection(session, path).await
    }

    async fn copy_data_object(
        &self,
        session: &Session,
        src: &str,
        dst: &str,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::CopyDataObject).await?;
        self.inner.copy_data_object(session, src, dst).await
    }

    async fn trim_replicas(
        &self,
        session: &Session,
        path: &str,
        options: &TrimOptions,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::TrimReplicas).await?;
        self.inner.trim_replicas(session, path, options).await
    }

    async fn replicate(
        &self,
        session: &Session,
        path: &str,
        resource: &str,
        backup: bool,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::Replicate).await?;
        self.inner.replicate(session, path, resource, backup).await
    }

    async fn move_to_resource(
        &self,
        session: &Session,
        path: &str,
        resource: &str,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::MoveToResource).await?;
        self.inner.move_to_resource(session, path, resource).await
    }

    async fn list_users(&self, session: &Session) -> Result<Vec<String>, RemoteError> {
        self.call(RemoteOp::ListUsers).await?;
        self.inner.list_users(session).await
    }

    async fn list_groups(&self, session: &Session) -> Result<Vec<String>, RemoteError> {
        self.call(RemoteOp::ListGroups).await?;
        self.inner.list_groups(session).await
    }

    async fn get_user_info(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<HashMap<String, String>, RemoteError> {
        self.call(RemoteOp::GetUserInfo).await?;
        self.inner.get_user_info(session, name).await
    }

    async fn get_group_members(
        &self,
        session: &Session,
        group: &str,
    ) -> Result<Vec<String>, RemoteError> {
        self.call(RemoteOp::GetGroupMembers).await?;
        self.inner.get_group_members(session, group).await
    }

    async fn add_user_to_group(
        &self,
        session: &Session,
        user: &str,
        zone: &str,
        group: &str,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::AddUserToGroup).await?;
        self.inner.add_user_to_group(session, user, zone, group).await
    }

    async fn list_metadata(
        &self,
        session: &Session,
        path: &str,
        kind: ObjectKind,
    ) -> Result<Vec<Avu>, RemoteError> {
        self.call(RemoteOp::ListMetadata).await?;
        self.inner.list_metadata(session, path, kind).await
    }

    async fn add_metadata(
        &self,
        session: &Session,
        path: &str,
        kind: ObjectKind,
        avu: &Avu,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::AddMetadata).await?;
        self.inner.add_metadata(session, path, kind, avu).await
    }

    async fn remove_metadata(
        &self,
        session: &Session,
        path: &str,
        kind: ObjectKind,
        avu: &Avu,
    ) -> Result<(), RemoteError> {
        self.call(RemoteOp::RemoveMetadata).await?;
        self.inner.remove_metadata(session, path, kind, avu).await
    }
}
