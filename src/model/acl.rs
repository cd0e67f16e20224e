//! Access control entries and their resolution against the entity cache

use crate::error::{CatalogError, CatalogResult};
use crate::model::entity::{EntityCache, Group, User};
use crate::model::object::ObjectKind;
use crate::services::catalog::backend::RawAcl;
use crate::services::catalog::pool::SessionPool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Permission level, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Null,
    Read,
    Write,
    Own,
}

impl AccessLevel {
    /// Keyword understood by `chmod`
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Null => "null",
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Own => "own",
        }
    }

    /// Parse an access string, mapping anything unrecognized to `Null`
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(AccessLevel::Null)
    }
}

impl FromStr for AccessLevel {
    type Err = CatalogError;

    /// Accepts both the listing spelling (`read object`, `modify object`)
    /// and the `chmod` keywords.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "own" => Ok(AccessLevel::Own),
            "modify object" | "write" => Ok(AccessLevel::Write),
            "read object" | "read" => Ok(AccessLevel::Read),
            "null" => Ok(AccessLevel::Null),
            other => Err(CatalogError::UnknownAccessLevel(other.to_string())),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject an access entry grants permission to
#[derive(Debug, Clone, PartialEq)]
pub enum AclSubject {
    User(Arc<User>),
    Group(Arc<Group>),
}

impl AclSubject {
    pub fn name(&self) -> &str {
        match self {
            AclSubject::User(u) => &u.name,
            AclSubject::Group(g) => &g.name,
        }
    }
}

/// One resolved permission record
#[derive(Debug, Clone, PartialEq)]
pub struct AccessControlEntry {
    pub subject: AclSubject,
    pub level: AccessLevel,
    pub kind: ObjectKind,
}

impl fmt::Display for AccessControlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.subject.name(), self.level, self.kind)
    }
}

/// Turns raw permission rows into typed entries
#[derive(Debug, Clone, Copy, Default)]
pub struct AclResolver {
    lenient_levels: bool,
}

impl AclResolver {
    /// `lenient_levels` maps unrecognized access strings to `Null` instead of failing
    pub fn new(lenient_levels: bool) -> Self {
        Self { lenient_levels }
    }

    /// Resolve every row, failing on the first unknown kind, level or subject
    pub async fn resolve(
        &self,
        raw: &[RawAcl],
        cache: &EntityCache,
        pool: &SessionPool,
    ) -> CatalogResult<Vec<AccessControlEntry>> {
        let mut entries = Vec::with_capacity(raw.len());
        for row in raw {
            entries.push(self.resolve_one(row, cache, pool).await?);
        }
        Ok(entries)
    }

    async fn resolve_one(
        &self,
        row: &RawAcl,
        cache: &EntityCache,
        pool: &SessionPool,
    ) -> CatalogResult<AccessControlEntry> {
        let kind = ObjectKind::from_subject_kind(&row.subject_kind)?;
        let level = self.level(&row.access)?;

        let subject = if kind == ObjectKind::Group {
            AclSubject::Group(cache.resolve_group(pool, &row.name).await?)
        } else {
            AclSubject::User(cache.resolve_user(pool, &row.name).await?)
        };

        Ok(AccessControlEntry {
            subject,
            level,
            kind,
        })
    }

    fn level(&self, access: &str) -> CatalogResult<AccessLevel> {
        match access.parse() {
            Ok(level) => Ok(level),
            Err(_) if self.lenient_levels => {
                tracing::warn!(access, "unrecognized access level, treating as null");
                Ok(AccessLevel::Null)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::Own > AccessLevel::Write);
        assert!(AccessLevel::Write > AccessLevel::Read);
        assert!(AccessLevel::Read > AccessLevel::Null);
    }

    #[test]
    fn test_access_level_parsing() {
        assert_eq!("own".parse::<AccessLevel>().unwrap(), AccessLevel::Own);
        assert_eq!(
            "modify object".parse::<AccessLevel>().unwrap(),
            AccessLevel::Write
        );
        assert_eq!(
            "read object".parse::<AccessLevel>().unwrap(),
            AccessLevel::Read
        );
        assert!(matches!(
            "delete object".parse::<AccessLevel>(),
            Err(CatalogError::UnknownAccessLevel(_))
        ));
        assert_eq!(AccessLevel::parse_lenient("delete object"), AccessLevel::Null);
    }

    #[test]
    fn test_chmod_keywords_parse_back() {
        for level in [
            AccessLevel::Null,
            AccessLevel::Read,
            AccessLevel::Write,
            AccessLevel::Own,
        ] {
            assert_eq!(level.as_str().parse::<AccessLevel>().unwrap(), level);
        }
    }
}
