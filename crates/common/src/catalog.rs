//! Local manifest store
//!
//! Manifests live in per-type directories under the config base as
//! `<name>.<object-type>.yaml`. Saves are atomic: the envelope is written
//! to a temp file in the target directory and renamed into place, so a
//! crash never leaves a half-written manifest behind.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::Config;
use crate::crypto::{KeyFingerprint, SigContext};
use crate::manifest::{Manifest, ManifestError, ObjectType};
use crate::obj::{Bridge, Container, User};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("not found in catalog: {0}")]
    NotFound(String),
}

/// Handle to the per-type manifest directories.
#[derive(Debug, Clone)]
pub struct Catalog {
    user_dir: PathBuf,
    container_dir: PathBuf,
    storage_dir: PathBuf,
    bridge_dir: PathBuf,
}

impl Catalog {
    pub fn new(config: &Config) -> Self {
        Catalog {
            user_dir: config.user_dir(),
            container_dir: config.container_dir(),
            storage_dir: config.storage_dir(),
            bridge_dir: config.bridge_dir(),
        }
    }

    fn dir_for(&self, object: ObjectType) -> &Path {
        match object {
            ObjectType::User => &self.user_dir,
            ObjectType::Container => &self.container_dir,
            ObjectType::Storage => &self.storage_dir,
            ObjectType::Bridge | ObjectType::Link => &self.bridge_dir,
        }
    }

    pub fn path_for(&self, name: &str, object: ObjectType) -> PathBuf {
        self.dir_for(object).join(format!("{name}.{object}.yaml"))
    }

    /// Persist a signed manifest under the given name. Atomic: the temp file
    /// is removed if anything fails before the rename.
    pub fn save(&self, name: &str, manifest: &Manifest) -> Result<PathBuf, CatalogError> {
        let object = manifest.object_type()?;
        let dir = self.dir_for(object);
        std::fs::create_dir_all(dir)?;

        let target = self.path_for(name, object);
        let temp = dir.join(format!(".{name}.{object}.yaml.tmp"));
        let bytes = manifest.to_bytes()?;

        if let Err(e) = std::fs::write(&temp, &bytes).and_then(|_| std::fs::rename(&temp, &target))
        {
            let _ = std::fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(target)
    }

    pub fn delete(&self, name: &str, object: ObjectType) -> Result<(), CatalogError> {
        let path = self.path_for(name, object);
        if !path.exists() {
            return Err(CatalogError::NotFound(format!("{name}.{object}.yaml")));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Load one manifest by name.
    pub fn load(
        &self,
        name: &str,
        object: ObjectType,
        sig: &SigContext,
    ) -> Result<Manifest, CatalogError> {
        let path = self.path_for(name, object);
        if !path.exists() {
            return Err(CatalogError::NotFound(format!("{name}.{object}.yaml")));
        }
        Ok(Manifest::from_file(&path, sig, Some(object), None)?)
    }

    /// Load every manifest of a type. Manifests that fail to verify or
    /// validate are skipped with a warning; one bad file must not take the
    /// whole catalog down.
    pub fn load_all(&self, object: ObjectType, sig: &SigContext) -> Vec<Manifest> {
        let dir = self.dir_for(object);
        let suffix = format!(".{object}.yaml");
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut manifests = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(&suffix) || name.starts_with('.') {
                continue;
            }
            match Manifest::from_file(&path, sig, Some(object), None) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }
        manifests
    }

    /// Load the pubkeys of every locally stored user into the signature
    /// context, so their manifests can verify. Users are self-signed, so
    /// keys are imported via the self-signed path.
    pub fn load_user_keys(&self, sig: &mut SigContext) -> Result<(), CatalogError> {
        let suffix = format!(".{}.yaml", ObjectType::User);
        let Ok(entries) = std::fs::read_dir(&self.user_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(&suffix) || name.starts_with('.') {
                continue;
            }
            let data = std::fs::read(entry.path())?;
            if let Err(e) = Manifest::verify_and_load_pubkeys(&data, sig) {
                tracing::warn!("cannot import keys from {}: {}", name, e);
            }
        }
        Ok(())
    }

    pub fn users(&self, sig: &SigContext) -> Vec<User> {
        self.load_all(ObjectType::User, sig)
            .into_iter()
            .filter_map(|m| User::try_from(m).ok())
            .collect()
    }

    pub fn containers(&self, sig: &SigContext) -> Vec<Container> {
        self.load_all(ObjectType::Container, sig)
            .into_iter()
            .filter_map(|m| Container::try_from(m).ok())
            .collect()
    }

    pub fn bridges(&self, sig: &SigContext) -> Vec<Bridge> {
        self.load_all(ObjectType::Bridge, sig)
            .into_iter()
            .filter_map(|m| Bridge::try_from(m).ok())
            .collect()
    }

    pub fn find_user(&self, owner: &KeyFingerprint, sig: &SigContext) -> Option<User> {
        self.users(sig).into_iter().find(|u| u.owner() == owner)
    }

    pub fn find_container_by_uuid(&self, uuid: Uuid, sig: &SigContext) -> Option<Container> {
        self.containers(sig).into_iter().find(|c| c.uuid() == uuid)
    }
}
