//! Catalog object model: kinds, data objects, users, groups, ACLs and metadata

pub mod acl;
pub mod entity;
pub mod meta;
pub mod object;

use chrono::{DateTime, Utc};

/// Parse a catalog timestamp (seconds since the epoch, possibly zero padded)
///
/// Unparseable values map to the epoch rather than failing the whole record.
pub fn timestamp_from_str(s: &str) -> DateTime<Utc> {
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
