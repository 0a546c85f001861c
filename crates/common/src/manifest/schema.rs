//! Field-shape validation for manifest bodies
//!
//! Checks run on the decrypted cleartext mapping, after signature
//! verification. Everything here rejects with [`ManifestError::Schema`]; no
//! check ever mutates the fields.

use std::str::FromStr;

use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::crypto::KeyFingerprint;

use super::{codec::ManifestError, CURRENT_VERSION};

/// The kinds of objects a signed manifest can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    User,
    Container,
    Storage,
    Bridge,
    Link,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::User => "user",
            ObjectType::Container => "container",
            ObjectType::Storage => "storage",
            ObjectType::Bridge => "bridge",
            ObjectType::Link => "link",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, ManifestError> {
        match s {
            "user" => Ok(ObjectType::User),
            "container" => Ok(ObjectType::Container),
            "storage" => Ok(ObjectType::Storage),
            "bridge" => Ok(ObjectType::Bridge),
            "link" => Ok(ObjectType::Link),
            other => Err(ManifestError::Schema(format!("unknown object type: {other:?}"))),
        }
    }
}

fn str_field<'a>(fields: &'a Mapping, name: &str) -> Result<&'a str, ManifestError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::Schema(format!("missing or non-string field: {name}")))
}

fn seq_field<'a>(fields: &'a Mapping, name: &str) -> Result<&'a Vec<Value>, ManifestError> {
    fields
        .get(name)
        .and_then(Value::as_sequence)
        .ok_or_else(|| ManifestError::Schema(format!("missing or non-list field: {name}")))
}

fn abs_paths<'a>(fields: &'a Mapping, name: &str) -> Result<Vec<&'a str>, ManifestError> {
    let seq = seq_field(fields, name)?;
    if seq.is_empty() {
        return Err(ManifestError::Schema(format!("{name} must not be empty")));
    }
    seq.iter()
        .map(|v| {
            v.as_str()
                .filter(|p| p.starts_with('/'))
                .ok_or_else(|| ManifestError::Schema(format!("{name} entries must be absolute paths")))
        })
        .collect()
}

/// Validate the version gate and per-type shape of a cleartext body.
///
/// `expected` pins the object type when the caller knows what it is loading
/// (e.g. the catalog loading `*.user.yaml`).
pub fn validate(fields: &Mapping, expected: Option<ObjectType>) -> Result<ObjectType, ManifestError> {
    match fields.get("version").and_then(Value::as_str) {
        Some(CURRENT_VERSION) => {}
        Some(other) => {
            return Err(ManifestError::Schema(format!(
                "unknown manifest version: {other:?}"
            )))
        }
        None => return Err(ManifestError::Schema("missing manifest version".into())),
    }

    let object: ObjectType = str_field(fields, "object")?.parse()?;
    if let Some(expected) = expected {
        if object != expected {
            return Err(ManifestError::Schema(format!(
                "expected a {expected} manifest, got {object}"
            )));
        }
    }

    let owner = str_field(fields, "owner")?;
    KeyFingerprint::from_str(owner)
        .map_err(|_| ManifestError::Schema(format!("owner is not a key fingerprint: {owner}")))?;

    match object {
        ObjectType::User => validate_user(fields)?,
        ObjectType::Container => validate_container(fields)?,
        ObjectType::Storage => validate_storage(fields)?,
        ObjectType::Bridge => validate_bridge(fields)?,
        ObjectType::Link => validate_link(fields)?,
    }
    Ok(object)
}

fn validate_user(fields: &Mapping) -> Result<(), ManifestError> {
    abs_paths(fields, "paths")?;
    let pubkeys = seq_field(fields, "pubkeys")?;
    if pubkeys.is_empty() {
        return Err(ManifestError::Schema("pubkeys must not be empty".into()));
    }
    for key in pubkeys {
        let hex_str = key
            .as_str()
            .ok_or_else(|| ManifestError::Schema("pubkeys entries must be strings".into()))?;
        crate::crypto::PublicKey::from_hex(hex_str)
            .map_err(|_| ManifestError::Schema(format!("invalid pubkey: {hex_str}")))?;
    }
    if let Some(members) = fields.get("members") {
        let members = members
            .as_sequence()
            .ok_or_else(|| ManifestError::Schema("members must be a list".into()))?;
        for member in members {
            let ok = member
                .as_mapping()
                .and_then(|m| m.get("user-path"))
                .map(Value::is_string)
                .unwrap_or(false);
            if !ok {
                return Err(ManifestError::Schema(
                    "members entries must carry a user-path".into(),
                ));
            }
        }
    }
    Ok(())
}

fn validate_container(fields: &Mapping) -> Result<(), ManifestError> {
    let paths = abs_paths(fields, "paths")?;
    let uuid_path = paths[0];
    let uuid = uuid_path
        .strip_prefix("/.uuid/")
        .ok_or_else(|| ManifestError::Schema("first container path must be /.uuid/<UUID>".into()))?;
    Uuid::parse_str(uuid)
        .map_err(|_| ManifestError::Schema(format!("invalid container uuid: {uuid}")))?;

    if let Some(access) = fields.get("access") {
        validate_access(access)?;
    }

    let backends = fields
        .get("backends")
        .and_then(Value::as_mapping)
        .ok_or_else(|| ManifestError::Schema("missing backends mapping".into()))?;
    let storages = backends
        .get("storage")
        .and_then(Value::as_sequence)
        .ok_or_else(|| ManifestError::Schema("missing backends.storage list".into()))?;

    let mut primaries = 0usize;
    for storage in storages {
        match storage {
            // inline storage definition; may itself still be encrypted
            Value::Mapping(map) => {
                if map.len() == 1 && map.contains_key("encrypted") {
                    continue;
                }
                if map
                    .get("primary")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    primaries += 1;
                }
            }
            // a URL reference to a standalone storage manifest
            Value::String(_) => {}
            _ => {
                return Err(ManifestError::Schema(
                    "backends.storage entries must be mappings or URLs".into(),
                ))
            }
        }
    }
    if primaries > 1 {
        return Err(ManifestError::Schema(
            "container has more than one primary storage".into(),
        ));
    }
    Ok(())
}

fn validate_storage(fields: &Mapping) -> Result<(), ManifestError> {
    let ty = str_field(fields, "type")?;
    if ty.is_empty() {
        return Err(ManifestError::Schema("storage type must not be empty".into()));
    }
    let container_path = str_field(fields, "container-path")?;
    if !container_path.starts_with("/.uuid/") {
        return Err(ManifestError::Schema(
            "container-path must be the container's /.uuid path".into(),
        ));
    }
    if let Some(backend_id) = fields.get("backend-id") {
        let raw = backend_id
            .as_str()
            .ok_or_else(|| ManifestError::Schema("backend-id must be a string".into()))?;
        Uuid::parse_str(raw)
            .map_err(|_| ManifestError::Schema(format!("invalid backend-id: {raw}")))?;
    }
    if let Some(interval) = fields.get("watcher-interval") {
        if interval.as_u64().is_none() {
            return Err(ManifestError::Schema(
                "watcher-interval must be a positive integer".into(),
            ));
        }
    }
    if let Some(access) = fields.get("access") {
        validate_access(access)?;
    }
    Ok(())
}

fn validate_bridge(fields: &Mapping) -> Result<(), ManifestError> {
    abs_paths(fields, "paths")?;
    match fields.get("user") {
        Some(Value::String(_)) => {}
        Some(Value::Mapping(map)) if map.get("object").and_then(Value::as_str) == Some("link") => {}
        _ => {
            return Err(ManifestError::Schema(
                "bridge user must be a manifest URL or a link object".into(),
            ))
        }
    }
    let pubkey = str_field(fields, "pubkey")?;
    crate::crypto::PublicKey::from_hex(pubkey)
        .map_err(|_| ManifestError::Schema(format!("invalid bridge pubkey: {pubkey}")))?;
    Ok(())
}

fn validate_link(fields: &Mapping) -> Result<(), ManifestError> {
    fields
        .get("storage")
        .and_then(Value::as_mapping)
        .ok_or_else(|| ManifestError::Schema("link must carry an inline storage".into()))?;
    let file = str_field(fields, "file")?;
    if !file.starts_with('/') {
        return Err(ManifestError::Schema("link file must be an absolute path".into()));
    }
    Ok(())
}

/// An access list is either the single wildcard entry (fully public) or a
/// list of `{user: <fpr>}` / `{user-path: <wl-url>}` entries.
pub(crate) fn validate_access(access: &Value) -> Result<(), ManifestError> {
    let entries = access
        .as_sequence()
        .ok_or_else(|| ManifestError::Schema("access must be a list".into()))?;
    if entries.is_empty() {
        return Err(ManifestError::Schema("access must not be empty".into()));
    }
    for entry in entries {
        let map = entry
            .as_mapping()
            .ok_or_else(|| ManifestError::Schema("access entries must be mappings".into()))?;
        let user = map.get("user").and_then(Value::as_str);
        let user_path = map.get("user-path").and_then(Value::as_str);
        match (user, user_path) {
            (Some("*"), None) => {
                if entries.len() > 1 {
                    return Err(ManifestError::Schema(
                        "wildcard access entry must be the only one".into(),
                    ));
                }
            }
            (Some(fpr), None) => {
                KeyFingerprint::from_str(fpr).map_err(|_| {
                    ManifestError::Schema(format!("access user is not a fingerprint: {fpr}"))
                })?;
            }
            (None, Some(path)) => {
                if !path.starts_with("wildland:") {
                    return Err(ManifestError::Schema(format!(
                        "access user-path is not a wildland url: {path}"
                    )));
                }
            }
            _ => {
                return Err(ManifestError::Schema(
                    "access entries must carry either user or user-path".into(),
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fields(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    const OWNER: &str = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";

    #[test]
    fn test_version_gate() {
        let body = fields(&format!(
            "version: \"2\"\nobject: user\nowner: \"{OWNER}\"\npaths: [/users/a]\npubkeys: [\"00\"]\n"
        ));
        let err = validate(&body, None).unwrap_err();
        assert!(matches!(err, ManifestError::Schema(_)));
    }

    #[test]
    fn test_container_uuid_path_required() {
        let body = fields(&format!(
            "version: \"1\"\nobject: container\nowner: \"{OWNER}\"\n\
             paths: [/data]\nbackends: {{storage: []}}\n"
        ));
        assert!(validate(&body, Some(ObjectType::Container)).is_err());
    }

    #[test]
    fn test_two_primary_storages_rejected() {
        let body = fields(&format!(
            "version: \"1\"\nobject: container\nowner: \"{OWNER}\"\n\
             paths: [\"/.uuid/5c34712e-e0a8-4b67-9317-9c3dbb1a4282\"]\n\
             backends:\n  storage:\n    - {{type: local, primary: true}}\n    - {{type: local, primary: true}}\n"
        ));
        assert!(validate(&body, None).is_err());
    }

    #[test]
    fn test_wildcard_access_must_be_sole_entry() {
        let access = serde_yaml::from_str(&format!("[{{user: \"*\"}}, {{user: \"{OWNER}\"}}]")).unwrap();
        assert!(validate_access(&access).is_err());

        let access = serde_yaml::from_str("[{user: \"*\"}]").unwrap();
        assert!(validate_access(&access).is_ok());
    }
}
