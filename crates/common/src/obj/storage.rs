use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::crypto::KeyFingerprint;
use crate::manifest::{Manifest, ManifestError, ObjectType};

use super::{parse_access, AccessEntry};

/// Where a storage advertises its subcontainer manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestPattern {
    /// A glob over paths inside the storage, e.g. `/manifests/*.yaml`.
    Glob(String),
    /// An explicit list of manifest paths.
    List(Vec<PathBuf>),
}

impl ManifestPattern {
    fn from_value(value: &Value) -> Result<Self, ManifestError> {
        let map = value
            .as_mapping()
            .ok_or_else(|| ManifestError::Schema("manifest-pattern must be a mapping".into()))?;
        match map.get("type").and_then(Value::as_str) {
            Some("glob") => {
                let path = map
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ManifestError::Schema("glob pattern needs a path".into()))?;
                Ok(ManifestPattern::Glob(path.to_string()))
            }
            Some("list") => {
                let paths = map
                    .get("paths")
                    .and_then(Value::as_sequence)
                    .ok_or_else(|| ManifestError::Schema("list pattern needs paths".into()))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect();
                Ok(ManifestPattern::List(paths))
            }
            other => Err(ManifestError::Schema(format!(
                "unknown manifest-pattern type: {other:?}"
            ))),
        }
    }
}

/// Typed view over a storage definition, standalone or inline.
///
/// `params` keeps the type-specific fields (e.g. `location` for the local
/// driver) untouched; the backend registry interprets them when a backend is
/// instantiated.
#[derive(Debug, Clone)]
pub struct Storage {
    owner: KeyFingerprint,
    backend_type: String,
    container_path: PathBuf,
    backend_id: Uuid,
    read_only: bool,
    trusted: bool,
    primary: bool,
    manifest_pattern: Option<ManifestPattern>,
    watcher_interval: Option<u64>,
    access: Vec<AccessEntry>,
    params: Mapping,
}

impl TryFrom<Manifest> for Storage {
    type Error = ManifestError;

    fn try_from(manifest: Manifest) -> Result<Self, ManifestError> {
        let fields = manifest.fields()?;
        crate::manifest::validate(fields, Some(ObjectType::Storage))?;
        let owner = manifest.owner()?;
        Storage::from_mapping(fields.clone(), owner)
    }
}

impl Storage {
    /// Build a storage from an inline container entry. `container-path`
    /// defaults to the container's uuid path and, when present, must match
    /// it.
    pub fn from_inline(
        mut map: Mapping,
        owner: &KeyFingerprint,
        uuid_path: &Path,
    ) -> Result<Self, ManifestError> {
        if let Some(path) = map.get("container-path").and_then(Value::as_str) {
            if Path::new(path) != uuid_path {
                return Err(ManifestError::Schema(format!(
                    "storage container-path {path:?} does not match container {uuid_path:?}"
                )));
            }
        } else {
            map.insert(
                Value::String("container-path".into()),
                Value::String(uuid_path.to_string_lossy().into_owned()),
            );
        }
        // inline storages inherit owner and version from the container
        if !map.contains_key("owner") {
            map.insert(
                Value::String("owner".into()),
                Value::String(owner.to_string()),
            );
        }
        Storage::from_mapping(map, owner.clone())
    }

    fn from_mapping(mut map: Mapping, owner: KeyFingerprint) -> Result<Self, ManifestError> {
        let backend_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::Schema("storage must have a type".into()))?
            .to_string();
        let container_path = map
            .get("container-path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| ManifestError::Schema("storage must have a container-path".into()))?;

        let backend_id = match map.get("backend-id").and_then(Value::as_str) {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|_| ManifestError::Schema(format!("invalid backend-id: {raw}")))?,
            // derive a stable id so remounts of the same definition match
            None => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(owner.as_str().as_bytes());
                hasher.update(container_path.to_string_lossy().as_bytes());
                hasher.update(backend_type.as_bytes());
                let digest = hasher.finalize();
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&digest.as_bytes()[..16]);
                Uuid::from_bytes(bytes)
            }
        };

        let read_only = map
            .get("read-only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let trusted = map.get("trusted").and_then(Value::as_bool).unwrap_or(false);
        let primary = map.get("primary").and_then(Value::as_bool).unwrap_or(false);
        let manifest_pattern = map
            .get("manifest-pattern")
            .map(ManifestPattern::from_value)
            .transpose()?;
        let watcher_interval = map.get("watcher-interval").and_then(Value::as_u64);
        let access = parse_access(map.get("access"))?;

        for meta in [
            "object", "version", "owner", "type", "container-path", "backend-id", "read-only",
            "trusted", "primary", "manifest-pattern", "watcher-interval", "access",
        ] {
            map.remove(meta);
        }

        Ok(Storage {
            owner,
            backend_type,
            container_path,
            backend_id,
            read_only,
            trusted,
            primary,
            manifest_pattern,
            watcher_interval,
            access,
            params: map,
        })
    }

    pub fn owner(&self) -> &KeyFingerprint {
        &self.owner
    }

    /// The manifest `type` string selecting the backend driver.
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn container_path(&self) -> &Path {
        &self.container_path
    }

    pub fn backend_id(&self) -> Uuid {
        self.backend_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Trusted storages may carry unsigned manifests of their owner.
    pub fn trusted(&self) -> bool {
        self.trusted
    }

    pub fn primary(&self) -> bool {
        self.primary
    }

    pub fn manifest_pattern(&self) -> Option<&ManifestPattern> {
        self.manifest_pattern.as_ref()
    }

    /// Polling interval for the scan-based watcher, in seconds.
    pub fn watcher_interval(&self) -> Option<u64> {
        self.watcher_interval
    }

    pub fn access(&self) -> &[AccessEntry] {
        &self.access
    }

    /// Type-specific backend parameters.
    pub fn params(&self) -> &Mapping {
        &self.params
    }

    /// Rebuild the inline mapping form of this storage (the shape carried in
    /// `backends.storage` and in mount commands).
    pub fn to_mapping(&self) -> Mapping {
        let mut map = Mapping::new();
        map.insert("object".into(), "storage".into());
        map.insert("owner".into(), self.owner.to_string().into());
        map.insert("type".into(), Value::String(self.backend_type.clone()));
        map.insert(
            "container-path".into(),
            Value::String(self.container_path.to_string_lossy().into_owned()),
        );
        map.insert(
            "backend-id".into(),
            Value::String(self.backend_id.to_string()),
        );
        if self.read_only {
            map.insert("read-only".into(), Value::Bool(true));
        }
        if self.trusted {
            map.insert("trusted".into(), Value::Bool(true));
        }
        if self.primary {
            map.insert("primary".into(), Value::Bool(true));
        }
        if let Some(pattern) = &self.manifest_pattern {
            let mut inner = Mapping::new();
            match pattern {
                ManifestPattern::Glob(glob) => {
                    inner.insert("type".into(), "glob".into());
                    inner.insert("path".into(), Value::String(glob.clone()));
                }
                ManifestPattern::List(paths) => {
                    inner.insert("type".into(), "list".into());
                    inner.insert(
                        "paths".into(),
                        Value::Sequence(
                            paths
                                .iter()
                                .map(|p| Value::String(p.to_string_lossy().into_owned()))
                                .collect(),
                        ),
                    );
                }
            }
            map.insert("manifest-pattern".into(), Value::Mapping(inner));
        }
        if let Some(interval) = self.watcher_interval {
            map.insert("watcher-interval".into(), Value::Number(interval.into()));
        }
        for (key, value) in &self.params {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const OWNER: &str = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";
    const UUID_PATH: &str = "/.uuid/5c34712e-e0a8-4b67-9317-9c3dbb1a4282";

    fn inline(yaml: &str) -> Result<Storage, ManifestError> {
        let map: Mapping = serde_yaml::from_str(yaml).unwrap();
        Storage::from_inline(map, &OWNER.parse().unwrap(), Path::new(UUID_PATH))
    }

    #[test]
    fn test_inline_defaults() {
        let storage = inline("type: local\nlocation: /tmp/data\n").unwrap();
        assert_eq!(storage.backend_type(), "local");
        assert_eq!(storage.container_path(), Path::new(UUID_PATH));
        assert!(!storage.read_only());
        assert_eq!(
            storage.params().get("location").and_then(Value::as_str),
            Some("/tmp/data")
        );
    }

    #[test]
    fn test_container_path_mismatch_rejected() {
        let err = inline("type: local\ncontainer-path: /.uuid/00000000-0000-0000-0000-000000000000\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_derived_backend_id_is_stable() {
        let a = inline("type: local\nlocation: /tmp/a\n").unwrap();
        let b = inline("type: local\nlocation: /tmp/a\n").unwrap();
        assert_eq!(a.backend_id(), b.backend_id());
    }
}
