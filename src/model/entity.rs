//! Users, groups and the per-connection cache that resolves them by name
//!
//! The cache is filled in bulk the first time a user (or group) is asked
//! for and then kept for the lifetime of the connection. Nothing refreshes
//! it behind the caller's back: `refresh_users` and `refresh_group` are the
//! only ways to pick up changes made on the catalog after the first load.

use crate::error::{CatalogError, CatalogResult};
use crate::model::object::{CatalogObject, ObjectKind};
use crate::model::timestamp_from_str;
use crate::services::catalog::pool::SessionPool;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Which cache a name is looked up in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Group,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => f.write_str("user"),
            EntityKind::Group => f.write_str("group"),
        }
    }
}

/// Identity record for a catalog user
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub name: String,
    pub id: i64,
    pub zone: String,
    /// One of `User`, `Admin` or `GroupAdmin`
    pub kind: ObjectKind,
    pub comment: String,
    pub info: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl User {
    /// Build a user from the key/value listing returned by `get_user_info`
    pub fn from_info(name: &str, info: &HashMap<String, String>) -> CatalogResult<Self> {
        let field = |key: &str| info.get(key).cloned().unwrap_or_default();
        let kind = ObjectKind::from_subject_kind(&field("user_type_name"))?;

        Ok(Self {
            name: name.to_string(),
            id: field("user_id").parse().unwrap_or_default(),
            zone: field("zone_name"),
            kind,
            comment: field("r_comment"),
            info: field("user_info"),
            create_time: timestamp_from_str(&field("create_ts")),
            modify_time: timestamp_from_str(&field("modify_ts")),
        })
    }
}

impl CatalogObject for User {
    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.zone)
    }
}

/// Identity record for a catalog group, with its resolved members
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub id: i64,
    pub zone: String,
    pub comment: String,
    pub info: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub members: Vec<Arc<User>>,
}

impl Group {
    pub fn has_member(&self, user_name: &str) -> bool {
        self.members.iter().any(|u| u.name == user_name)
    }
}

impl CatalogObject for Group {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Group
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Member listings come back as `name#zone`
fn strip_zone(name: &str) -> &str {
    name.split('#').next().unwrap_or(name)
}

type UserMap = HashMap<String, Arc<User>>;
type GroupMap = HashMap<String, Arc<Group>>;

/// Per-connection cache of resolved users and groups
#[derive(Debug, Default)]
pub struct EntityCache {
    users: RwLock<Option<UserMap>>,
    groups: RwLock<Option<GroupMap>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the bulk user load has happened
    pub async fn users_loaded(&self) -> bool {
        self.users.read().await.is_some()
    }

    /// Whether the bulk group load has happened
    pub async fn groups_loaded(&self) -> bool {
        self.groups.read().await.is_some()
    }

    /// Resolve a user by name, loading every user on first use
    ///
    /// # Errors
    ///
    /// `CacheDesync` if the name is unknown after the load.
    pub async fn resolve_user(&self, pool: &SessionPool, name: &str) -> CatalogResult<Arc<User>> {
        self.ensure_users(pool).await?;
        let name = strip_zone(name);
        self.find_user(name)
            .await
            .ok_or_else(|| CatalogError::CacheDesync {
                kind: EntityKind::User,
                name: name.to_string(),
            })
    }

    /// Resolve a group by name, loading every group (and its members) on first use
    pub async fn resolve_group(
        &self,
        pool: &SessionPool,
        name: &str,
    ) -> CatalogResult<Arc<Group>> {
        self.ensure_groups(pool).await?;
        let name = strip_zone(name);
        self.find_group(name)
            .await
            .ok_or_else(|| CatalogError::CacheDesync {
                kind: EntityKind::Group,
                name: name.to_string(),
            })
    }

    /// Cache lookup without triggering a load
    pub async fn find_user(&self, name: &str) -> Option<Arc<User>> {
        let users = self.users.read().await;
        users.as_ref().and_then(|u| u.get(strip_zone(name)).cloned())
    }

    /// Cache lookup without triggering a load
    pub async fn find_group(&self, name: &str) -> Option<Arc<Group>> {
        let groups = self.groups.read().await;
        groups.as_ref().and_then(|g| g.get(strip_zone(name)).cloned())
    }

    /// All cached users, sorted by name
    pub async fn users(&self, pool: &SessionPool) -> CatalogResult<Vec<Arc<User>>> {
        self.ensure_users(pool).await?;
        let users = self.users.read().await;
        let mut list: Vec<_> = users.iter().flat_map(|m| m.values().cloned()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// All cached groups, sorted by name
    pub async fn groups(&self, pool: &SessionPool) -> CatalogResult<Vec<Arc<Group>>> {
        self.ensure_groups(pool).await?;
        let groups = self.groups.read().await;
        let mut list: Vec<_> = groups.iter().flat_map(|m| m.values().cloned()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Drop and reload every user
    pub async fn refresh_users(&self, pool: &SessionPool) -> CatalogResult<()> {
        let mut users = self.users.write().await;
        *users = Some(load_users(pool).await?);
        Ok(())
    }

    /// Reload one group's info and membership
    pub async fn refresh_group(&self, pool: &SessionPool, name: &str) -> CatalogResult<Arc<Group>> {
        self.ensure_groups(pool).await?;
        let group = {
            let users = self.users.read().await;
            let empty = UserMap::new();
            Arc::new(load_group(pool, users.as_ref().unwrap_or(&empty), name).await?)
        };

        let mut groups = self.groups.write().await;
        groups
            .get_or_insert_with(GroupMap::new)
            .insert(group.name.clone(), Arc::clone(&group));
        Ok(group)
    }

    async fn ensure_users(&self, pool: &SessionPool) -> CatalogResult<()> {
        if self.users_loaded().await {
            return Ok(());
        }

        let mut users = self.users.write().await;
        // Another caller may have loaded while we waited for the write lock
        if users.is_none() {
            *users = Some(load_users(pool).await?);
        }
        Ok(())
    }

    async fn ensure_groups(&self, pool: &SessionPool) -> CatalogResult<()> {
        if self.groups_loaded().await {
            return Ok(());
        }
        self.ensure_users(pool).await?;

        let mut groups = self.groups.write().await;
        if groups.is_none() {
            let users = self.users.read().await;
            let empty = UserMap::new();
            *groups = Some(load_groups(pool, users.as_ref().unwrap_or(&empty)).await?);
        }
        Ok(())
    }
}

async fn load_users(pool: &SessionPool) -> CatalogResult<UserMap> {
    let session = pool.acquire().await?;
    let names = session
        .backend()
        .list_users(session.session())
        .await
        .map_err(|e| CatalogError::remote("list users", "", e))?;

    let mut users = UserMap::with_capacity(names.len());
    for name in names {
        let info = session
            .backend()
            .get_user_info(session.session(), &name)
            .await
            .map_err(|e| CatalogError::remote("get user info", name.as_str(), e))?;
        let user = User::from_info(&name, &info)?;
        users.insert(name, Arc::new(user));
    }

    tracing::debug!(count = users.len(), "loaded users into entity cache");
    Ok(users)
}

async fn load_groups(pool: &SessionPool, users: &UserMap) -> CatalogResult<GroupMap> {
    let names = {
        let session = pool.acquire().await?;
        session
            .backend()
            .list_groups(session.session())
            .await
            .map_err(|e| CatalogError::remote("list groups", "", e))?
    };

    let mut groups = GroupMap::with_capacity(names.len());
    for name in names {
        let group = load_group(pool, users, &name).await?;
        groups.insert(name, Arc::new(group));
    }

    tracing::debug!(count = groups.len(), "loaded groups into entity cache");
    Ok(groups)
}

async fn load_group(pool: &SessionPool, users: &UserMap, name: &str) -> CatalogResult<Group> {
    let session = pool.acquire().await?;
    let info = session
        .backend()
        .get_user_info(session.session(), name)
        .await
        .map_err(|e| CatalogError::remote("get group info", name, e))?;
    let member_names = session
        .backend()
        .get_group_members(session.session(), name)
        .await
        .map_err(|e| CatalogError::remote("get group members", name, e))?;
    drop(session);

    let mut members = Vec::with_capacity(member_names.len());
    for member in &member_names {
        let member = strip_zone(member);
        let user = users
            .get(member)
            .cloned()
            .ok_or_else(|| CatalogError::CacheDesync {
                kind: EntityKind::User,
                name: member.to_string(),
            })?;
        members.push(user);
    }

    let field = |key: &str| info.get(key).cloned().unwrap_or_default();
    Ok(Group {
        name: name.to_string(),
        id: field("user_id").parse().unwrap_or_default(),
        zone: field("zone_name"),
        comment: field("r_comment"),
        info: field("user_info"),
        create_time: timestamp_from_str(&field("create_ts")),
        modify_time: timestamp_from_str(&field("modify_ts")),
        members,
    })
}
