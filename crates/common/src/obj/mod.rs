//! Typed views over validated manifests
//!
//! The manifest codec hands out generic field mappings; this module turns
//! them into strongly-typed objects and enforces the data-model invariants
//! on construction:
//!
//! - a container's first path is its immutable `/.uuid/<UUID>` path
//! - a storage's `container-path` must match a path of its container
//! - at most one storage is `primary`
//! - access lists are either the public wildcard or concrete subjects
//!
//! Every view keeps the originating [`Manifest`](crate::manifest::Manifest)
//! so it can be re-serialized or republished without loss.

mod bridge;
mod container;
mod link;
mod storage;
mod template;
mod user;

pub use bridge::{Bridge, UserRef};
pub use container::{Container, StorageRef};
pub use link::Link;
pub use storage::{ManifestPattern, Storage};
pub use template::StorageTemplate;
pub use user::User;

use serde_yaml::Value;

use crate::crypto::{KeyFingerprint, PublicKey};
use crate::manifest::ManifestError;

/// A subject granted access to an encrypted manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessEntry {
    /// `{user: "*"}`: fully public, forbids encryption.
    Wildcard,
    /// `{user: <fpr>}`
    User(KeyFingerprint),
    /// `{user-path: <wildland url>}`, with the pubkeys the path resolved to
    /// when the access list was built (encryption needs concrete keys).
    UserPath {
        path: String,
        pubkeys: Vec<PublicKey>,
    },
}

pub(crate) fn parse_access(value: Option<&Value>) -> Result<Vec<AccessEntry>, ManifestError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    crate::manifest::schema_validate_access(value)?;
    let mut entries = Vec::new();
    for entry in value.as_sequence().into_iter().flatten() {
        let map = entry.as_mapping().cloned().unwrap_or_default();
        if let Some(user) = map.get("user").and_then(Value::as_str) {
            if user == "*" {
                entries.push(AccessEntry::Wildcard);
            } else {
                entries.push(AccessEntry::User(user.parse().map_err(|_| {
                    ManifestError::Schema(format!("access user is not a fingerprint: {user}"))
                })?));
            }
        } else if let Some(path) = map.get("user-path").and_then(Value::as_str) {
            let pubkeys = map
                .get("pubkeys")
                .and_then(Value::as_sequence)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(|hex_str| {
                    PublicKey::from_hex(hex_str).map_err(|_| {
                        ManifestError::Schema(format!("invalid access pubkey: {hex_str}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            entries.push(AccessEntry::UserPath {
                path: path.to_string(),
                pubkeys,
            });
        }
    }
    Ok(entries)
}
