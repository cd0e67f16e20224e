use crate::error::{CatalogError, CatalogResult};
use crate::model::entity::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of object the catalog knows about
///
/// Closed set: anything else coming back from the catalog is rejected with
/// `CatalogError::UnknownKind` rather than mapped to a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    DataObject,
    Collection,
    Zone,
    Resource,
    ResourceGroup,
    User,
    Admin,
    GroupAdmin,
    Group,
}

impl ObjectKind {
    /// Short code used in collection listings (`d`, `C`, ...)
    pub fn code(self) -> &'static str {
        match self {
            ObjectKind::DataObject => "d",
            ObjectKind::Collection => "C",
            ObjectKind::Zone => "Z",
            ObjectKind::Resource => "R",
            ObjectKind::ResourceGroup => "RG",
            ObjectKind::User => "u",
            ObjectKind::Admin => "a",
            ObjectKind::GroupAdmin => "ga",
            ObjectKind::Group => "g",
        }
    }

    /// Parse the subject kind string the catalog attaches to users and ACL rows
    pub fn from_subject_kind(s: &str) -> CatalogResult<Self> {
        match s {
            "rodsuser" => Ok(ObjectKind::User),
            "rodsadmin" => Ok(ObjectKind::Admin),
            "groupadmin" => Ok(ObjectKind::GroupAdmin),
            "rodsgroup" => Ok(ObjectKind::Group),
            other => Err(CatalogError::UnknownKind(other.to_string())),
        }
    }

    /// Subject kind string understood by the catalog, if this is a subject kind
    pub fn subject_kind(self) -> Option<&'static str> {
        match self {
            ObjectKind::User => Some("rodsuser"),
            ObjectKind::Admin => Some("rodsadmin"),
            ObjectKind::GroupAdmin => Some("groupadmin"),
            ObjectKind::Group => Some("rodsgroup"),
            _ => None,
        }
    }

    /// Users, admins and group admins all resolve against the user cache
    pub fn is_user_like(self) -> bool {
        matches!(
            self,
            ObjectKind::User | ObjectKind::Admin | ObjectKind::GroupAdmin
        )
    }
}

impl FromStr for ObjectKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "d" => Ok(ObjectKind::DataObject),
            "C" => Ok(ObjectKind::Collection),
            "Z" => Ok(ObjectKind::Zone),
            "R" => Ok(ObjectKind::Resource),
            "RG" => Ok(ObjectKind::ResourceGroup),
            "u" => Ok(ObjectKind::User),
            "a" => Ok(ObjectKind::Admin),
            "ga" => Ok(ObjectKind::GroupAdmin),
            "g" => Ok(ObjectKind::Group),
            other => ObjectKind::from_subject_kind(other),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Common capability of everything stored in the catalog
pub trait CatalogObject {
    fn kind(&self) -> ObjectKind;
    fn name(&self) -> &str;
    fn path(&self) -> &str;
}

/// One stored copy of a data object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub number: u32,
    pub resource: String,
}

/// Leaf catalog entry describing one stored file
#[derive(Debug, Clone)]
pub struct DataObject {
    pub path: String,
    pub name: String,
    pub owner_name: String,
    pub owner: Option<Arc<User>>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
    pub data_id: String,
    /// Set when the collection was read with replica information
    pub replica: Option<Replica>,
}

impl CatalogObject for DataObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::DataObject
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// Last component of a catalog path
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Parent of a catalog path (`/` for top-level entries)
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Join a collection path and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        for kind in [
            ObjectKind::DataObject,
            ObjectKind::Collection,
            ObjectKind::Zone,
            ObjectKind::Resource,
            ObjectKind::ResourceGroup,
            ObjectKind::User,
            ObjectKind::Admin,
            ObjectKind::GroupAdmin,
            ObjectKind::Group,
        ] {
            assert_eq!(kind.code().parse::<ObjectKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_subject_kind_parsing() {
        assert_eq!(
            ObjectKind::from_subject_kind("rodsgroup").unwrap(),
            ObjectKind::Group
        );
        assert!(ObjectKind::from_subject_kind("rodsadmin")
            .unwrap()
            .is_user_like());
        assert!(matches!(
            ObjectKind::from_subject_kind("rodsrobot"),
            Err(CatalogError::UnknownKind(s)) if s == "rodsrobot"
        ));
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(base_name("/tempZone/home/rods/"), "rods");
        assert_eq!(base_name("/tempZone"), "tempZone");
        assert_eq!(parent_path("/tempZone/home/rods"), "/tempZone/home");
        assert_eq!(parent_path("/tempZone"), "/");
        assert_eq!(join_path("/", "tempZone"), "/tempZone");
        assert_eq!(join_path("/a/b", "c"), "/a/b/c");
    }
}
