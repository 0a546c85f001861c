use std::path::PathBuf;

use serde_yaml::Value;
use uuid::Uuid;

use crate::crypto::KeyFingerprint;
use crate::manifest::{Manifest, ManifestError, ObjectType};

use super::{parse_access, AccessEntry, Storage};

/// A container's storage entry, before any backend is instantiated.
#[derive(Debug, Clone)]
pub enum StorageRef {
    /// Inline storage definition (decrypted).
    Inline(Box<Storage>),
    /// URL of a standalone storage manifest.
    Url(String),
    /// Inline definition this process could not decrypt.
    Encrypted,
}

/// Typed view over a container manifest: the unit of mounting.
#[derive(Debug, Clone)]
pub struct Container {
    manifest: Manifest,
    owner: KeyFingerprint,
    uuid: Uuid,
    paths: Vec<PathBuf>,
    title: Option<String>,
    categories: Vec<PathBuf>,
    storages: Vec<StorageRef>,
    access: Vec<AccessEntry>,
}

impl TryFrom<Manifest> for Container {
    type Error = ManifestError;

    fn try_from(manifest: Manifest) -> Result<Self, ManifestError> {
        let fields = manifest.fields()?;
        crate::manifest::validate(fields, Some(ObjectType::Container))?;

        let owner = manifest.owner()?;
        let paths: Vec<PathBuf> = fields
            .get("paths")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect();
        // schema guarantees the shape of the first path
        let uuid = Uuid::parse_str(
            paths[0]
                .strip_prefix("/.uuid/")
                .expect("validated uuid path")
                .to_str()
                .expect("validated uuid path"),
        )
        .expect("validated uuid path");

        let title = fields
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        let categories = fields
            .get("categories")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect();
        let access = parse_access(fields.get("access"))?;

        let mut storages = Vec::new();
        let raw_storages = fields
            .get("backends")
            .and_then(Value::as_mapping)
            .and_then(|b| b.get("storage"))
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default();
        for raw in raw_storages {
            match raw {
                Value::String(url) => storages.push(StorageRef::Url(url)),
                Value::Mapping(map) if map.len() == 1 && map.contains_key("encrypted") => {
                    storages.push(StorageRef::Encrypted)
                }
                Value::Mapping(map) => {
                    let storage = Storage::from_inline(map, &owner, &paths[0])?;
                    storages.push(StorageRef::Inline(Box::new(storage)));
                }
                _ => {
                    return Err(ManifestError::Schema(
                        "backends.storage entries must be mappings or URLs".into(),
                    ))
                }
            }
        }

        Ok(Container {
            manifest,
            owner,
            uuid,
            paths,
            title,
            categories,
            storages,
            access,
        })
    }
}

impl Container {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn owner(&self) -> &KeyFingerprint {
        &self.owner
    }

    /// The container's immutable identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The `/.uuid/<UUID>` path (always the first manifest path).
    pub fn uuid_path(&self) -> &PathBuf {
        &self.paths[0]
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn categories(&self) -> &[PathBuf] {
        &self.categories
    }

    pub fn storages(&self) -> &[StorageRef] {
        &self.storages
    }

    pub fn access_subjects(&self) -> &[AccessEntry] {
        &self.access
    }

    /// All paths the container is visible under: the manifest paths plus the
    /// synthetic category paths.
    ///
    /// With a title, every category yields `<category>/<title>`, and every
    /// ordered pair of distinct categories yields the permutation path
    /// `<cat1>/@<cat2>/<title>` (the second category joins with `@` so the
    /// permutation directories are distinguishable from plain ones).
    pub fn mount_paths(&self) -> Vec<PathBuf> {
        let mut out = self.paths.clone();
        let Some(title) = &self.title else {
            return out;
        };
        for category in &self.categories {
            out.push(category.join(title));
        }
        for first in &self.categories {
            for second in &self.categories {
                if first == second {
                    continue;
                }
                let tail = format!("@{}", second.to_string_lossy().trim_start_matches('/'));
                out.push(first.join(tail).join(title));
            }
        }
        out
    }

    /// The storage used by default for reads and writes: the one marked
    /// `primary: true`, or the first one.
    pub fn primary_storage(&self) -> Option<&StorageRef> {
        self.storages
            .iter()
            .find(|s| matches!(s, StorageRef::Inline(storage) if storage.primary()))
            .or_else(|| self.storages.first())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn container(title: Option<&str>, categories: &[&str]) -> Container {
        let owner = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";
        let title_line = title.map(|t| format!("title: {t}\n")).unwrap_or_default();
        let cats = categories
            .iter()
            .map(|c| format!("  - {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        let yaml = format!(
            "version: \"1\"\nobject: container\nowner: \"{owner}\"\n\
             paths:\n  - /.uuid/5c34712e-e0a8-4b67-9317-9c3dbb1a4282\n  - /data/notes\n\
             {title_line}categories:\n{cats}\nbackends:\n  storage: []\n"
        );
        let manifest = Manifest::from_fields(serde_yaml::from_str(&yaml).unwrap()).unwrap();
        Container::try_from(manifest).unwrap()
    }

    #[test]
    fn test_mount_paths_cross_product() {
        let container = container(Some("notes"), &["/docs", "/work/text"]);
        let paths = container.mount_paths();

        assert!(paths.contains(&PathBuf::from("/data/notes")));
        assert!(paths.contains(&PathBuf::from("/docs/notes")));
        assert!(paths.contains(&PathBuf::from("/work/text/notes")));
        assert!(paths.contains(&PathBuf::from("/docs/@work/text/notes")));
        assert!(paths.contains(&PathBuf::from("/work/text/@docs/notes")));
        // manifest paths always included
        assert!(paths.contains(container.uuid_path()));
    }

    #[test]
    fn test_mount_paths_without_title() {
        let container = container(None, &["/docs"]);
        assert_eq!(container.mount_paths(), container.paths());
    }

    #[test]
    fn test_access_subjects_typed_view() {
        let owner = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";
        let reader = "0x7265616465727265616465727265616465727265616465727265616465727265";
        let key = crate::crypto::SecretKey::generate().public();
        let yaml = format!(
            "version: \"1\"\nobject: container\nowner: \"{owner}\"\n\
             paths:\n  - /.uuid/5c34712e-e0a8-4b67-9317-9c3dbb1a4282\n\
             access:\n  - user: \"{reader}\"\n  - user-path: \"wildland:{owner}:/users/friend:\"\n    pubkeys: [\"{}\"]\n\
             backends:\n  storage: []\n",
            key.to_hex()
        );
        let manifest = Manifest::from_fields(serde_yaml::from_str(&yaml).unwrap()).unwrap();
        let container = Container::try_from(manifest).unwrap();

        assert_eq!(
            container.access_subjects(),
            [
                AccessEntry::User(reader.parse().unwrap()),
                AccessEntry::UserPath {
                    path: format!("wildland:{owner}:/users/friend:"),
                    pubkeys: vec![key],
                },
            ]
        );
    }
}
