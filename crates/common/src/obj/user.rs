use std::path::PathBuf;

use serde_yaml::Value;

use crate::crypto::{KeyFingerprint, PublicKey};
use crate::manifest::{Manifest, ManifestError, ObjectType};

/// Typed view over a user manifest
///
/// A user is the trust anchor of a forest: it is signed by its own primary
/// key, lists the verification keys that may sign on its behalf, points at
/// the containers making up its manifests catalog and may lend access to
/// other users through `members`.
#[derive(Debug, Clone)]
pub struct User {
    manifest: Manifest,
    owner: KeyFingerprint,
    paths: Vec<PathBuf>,
    pubkeys: Vec<PublicKey>,
    manifests_catalog: Vec<Value>,
    members: Vec<String>,
}

impl TryFrom<Manifest> for User {
    type Error = ManifestError;

    fn try_from(manifest: Manifest) -> Result<Self, ManifestError> {
        let fields = manifest.fields()?;
        crate::manifest::validate(fields, Some(ObjectType::User))?;

        let owner = manifest.owner()?;
        let paths = fields
            .get("paths")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect();
        let pubkeys = fields
            .get("pubkeys")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|hex_str| {
                PublicKey::from_hex(hex_str)
                    .map_err(|_| ManifestError::Schema(format!("invalid pubkey: {hex_str}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let manifests_catalog = fields
            .get("manifests-catalog")
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default();
        let members = fields
            .get("members")
            .and_then(Value::as_sequence)
            .into_iter()
            .flatten()
            .filter_map(|m| m.as_mapping())
            .filter_map(|m| m.get("user-path").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        Ok(User {
            manifest,
            owner,
            paths,
            pubkeys,
            manifests_catalog,
            members,
        })
    }
}

impl User {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn owner(&self) -> &KeyFingerprint {
        &self.owner
    }

    /// User paths inside the virtual namespace (`/users/<name>`).
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Verification keys listed by the manifest; the first one is the
    /// primary key the user signs with.
    pub fn pubkeys(&self) -> &[PublicKey] {
        &self.pubkeys
    }

    pub fn primary_pubkey(&self) -> &PublicKey {
        // schema guarantees at least one entry
        &self.pubkeys[0]
    }

    /// Raw catalog entries: each is a manifest URL string, a link object or
    /// an inline container definition.
    pub fn manifests_catalog(&self) -> &[Value] {
        &self.manifests_catalog
    }

    /// `user-path` grants: users listed here gain access to objects owned by
    /// this user. Expansion to keys is the resolver's job.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Whether the given key may sign manifests for this user without
    /// consulting any external state.
    pub fn owns_key(&self, key: &PublicKey) -> bool {
        self.pubkeys.contains(key)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SecretKey;
    use serde_yaml::Mapping;

    fn user_fields(owner: &KeyFingerprint, pubkey: &PublicKey) -> Mapping {
        serde_yaml::from_str(&format!(
            "version: \"1\"\nobject: user\nowner: \"{owner}\"\n\
             paths: [/users/alice]\npubkeys: [\"{}\"]\n",
            pubkey.to_hex()
        ))
        .unwrap()
    }

    #[test]
    fn test_user_view() {
        let key = SecretKey::generate();
        let fpr = key.public().fingerprint();
        let manifest = Manifest::from_fields(user_fields(&fpr, &key.public())).unwrap();
        let user = User::try_from(manifest).unwrap();

        assert_eq!(user.owner(), &fpr);
        assert_eq!(user.paths(), [PathBuf::from("/users/alice")]);
        assert!(user.owns_key(&key.public()));
        assert!(!user.owns_key(&SecretKey::generate().public()));
    }
}
