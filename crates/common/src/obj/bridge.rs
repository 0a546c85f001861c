use std::path::PathBuf;

use serde_yaml::Value;

use crate::crypto::{KeyFingerprint, PublicKey};
use crate::manifest::{Manifest, ManifestError, ObjectType};

use super::Link;

/// How a bridge locates the user manifest it vouches for.
#[derive(Debug, Clone)]
pub enum UserRef {
    /// A fetchable manifest URL (wildland, file or https).
    Url(String),
    /// A link into a storage.
    Link(Box<Link>),
}

/// Typed view over a bridge manifest
///
/// A bridge is a signed attestation by `owner` that the referenced user
/// manifest is trustworthy at the given paths. The embedded `pubkey` must
/// match one of the target user's `pubkeys` after resolution; the resolver
/// checks that before switching owners.
#[derive(Debug, Clone)]
pub struct Bridge {
    manifest: Manifest,
    owner: KeyFingerprint,
    user: UserRef,
    pubkey: PublicKey,
    paths: Vec<PathBuf>,
}

impl TryFrom<Manifest> for Bridge {
    type Error = ManifestError;

    fn try_from(manifest: Manifest) -> Result<Self, ManifestError> {
        let fields = manifest.fields()?;
        crate::manifest::validate(fields, Some(ObjectType::Bridge))?;

        let owner = manifest.owner()?;
        let user = match fields.get("user") {
            Some(Value::String(url)) => UserRef::Url(url.clone()),
            Some(Value::Mapping(map)) => {
                UserRef::Link(Box::new(Link::from_mapping(map.clone(), &owner)?))
            }
            _ => unreachable!("validated bridge user"),
        };
        let pubkey = fields
            .get("pubkey")
            .and_then(Value::as_str)
            .map(PublicKey::from_hex)
            .expect("validated bridge pubkey")
            .map_err(|_| ManifestError::Schema("invalid bridge pubkey".into()))?;
        let paths = fields
            .get("paths")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect();

        Ok(Bridge {
            manifest,
            owner,
            user,
            pubkey,
            paths,
        })
    }
}

impl Bridge {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn owner(&self) -> &KeyFingerprint {
        &self.owner
    }

    pub fn user(&self) -> &UserRef {
        &self.user
    }

    /// The primary key the target user is expected to present.
    pub fn pubkey(&self) -> &PublicKey {
        &self.pubkey
    }

    /// Paths the signer mounts the target user under (e.g. `/forests/bob`).
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}
