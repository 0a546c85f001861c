use std::path::PathBuf;

use serde_yaml::{Mapping, Value};

use crate::crypto::KeyFingerprint;
use crate::manifest::ManifestError;

use super::Storage;

/// An indirection to a manifest living *inside* a storage, rather than at a
/// fetchable URL: an inline storage definition plus a file path within it.
#[derive(Debug, Clone)]
pub struct Link {
    storage: Storage,
    file: PathBuf,
}

impl Link {
    pub fn from_mapping(map: Mapping, owner: &KeyFingerprint) -> Result<Self, ManifestError> {
        if map.get("object").and_then(Value::as_str) != Some("link") {
            return Err(ManifestError::Schema("not a link object".into()));
        }
        let storage_map = map
            .get("storage")
            .and_then(Value::as_mapping)
            .cloned()
            .ok_or_else(|| ManifestError::Schema("link must carry an inline storage".into()))?;
        let file = map
            .get("file")
            .and_then(Value::as_str)
            .filter(|f| f.starts_with('/'))
            .map(PathBuf::from)
            .ok_or_else(|| ManifestError::Schema("link file must be an absolute path".into()))?;

        // a link's storage has no enclosing container; keep whatever
        // container-path it declares
        let container_path = storage_map
            .get("container-path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/.uuid/00000000-0000-0000-0000-000000000000"));
        let storage = Storage::from_inline(storage_map, owner, &container_path)?;

        Ok(Link { storage, file })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn file(&self) -> &PathBuf {
        &self.file
    }
}
