use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::crypto::{EncryptedPayload, KeyFingerprint, PublicKey, SigContext, SigError};
use crate::obj::AccessEntry;

use super::header::{split_header, Header, HEADER_SEPARATOR};
use super::schema::{self, ObjectType};

/// Errors during manifest loading, construction or serialization
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest parse error: {0}")]
    Parse(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("signature verification failed: {0}")]
    Signature(String),
    #[error("cannot decrypt manifest: decryption key unavailable")]
    Unencryptable,
    #[error("trying to read an unsigned manifest")]
    Unsigned,
    #[error("manifest owner does not have access to signing key: header {header}, manifest {owner}")]
    WrongOwner {
        header: String,
        owner: String,
    },
    #[error("cannot encrypt manifest: {0}")]
    Encrypt(String),
    #[error("manifest I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SigError> for ManifestError {
    fn from(e: SigError) -> Self {
        match e {
            SigError::Decrypt(_) => ManifestError::Unencryptable,
            other => ManifestError::Signature(other.to_string()),
        }
    }
}

/// A loaded manifest
///
/// The field mapping is the decrypted cleartext; `body` holds the exact
/// bytes the signature covers (the possibly-encrypted serialized form).
/// Fields are only accessible once the signature has been verified or the
/// manifest explicitly accepted from a trusted owner.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Set once the signature is verified (or an unsigned manifest is
    /// explicitly accepted).
    header: Option<Header>,
    fields: Mapping,
    /// The signed bytes, carried verbatim. `to_bytes` never re-serializes.
    body: Vec<u8>,
    local_path: Option<PathBuf>,
}

impl Manifest {
    /// Build a manifest from a cleartext field mapping. It still has to be
    /// signed before it can be serialized.
    pub fn from_fields(fields: Mapping) -> Result<Self, ManifestError> {
        if !fields.contains_key("owner") {
            return Err(ManifestError::Schema("manifest must have an owner".into()));
        }
        let body = serialize_body(&fields)?;
        Ok(Manifest {
            header: Some(Header::new(None)),
            fields,
            body,
            local_path: None,
        })
    }

    /// Load and verify a manifest from its envelope bytes.
    ///
    /// `trusted_owner` accepts a signature-less manifest from that owner
    /// (manifests read out of a storage marked `trusted`).
    /// `allow_only_primary_key` refuses signatures made with auxiliary keys
    /// of the owner (required for user manifests, which anchor trust).
    pub fn from_bytes(
        data: &[u8],
        sig: &SigContext,
        expected: Option<ObjectType>,
        trusted_owner: Option<&KeyFingerprint>,
        allow_only_primary_key: bool,
    ) -> Result<Self, ManifestError> {
        let (header_data, body) = split_header(data)?;
        let header = Header::from_bytes(header_data)?;

        // the signature is checked over the raw body bytes before anything
        // is parsed or decrypted
        let header_signer = header
            .signature
            .as_ref()
            .map(|signature| sig.verify(signature, body, None))
            .transpose()?;

        let fields = parse_body(body, Some(sig))?;
        let owner_raw = fields
            .get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::Schema("manifest must have an owner".into()))?;

        match header_signer {
            None => {
                let trusted = trusted_owner.map(KeyFingerprint::as_str);
                if trusted != Some(owner_raw) {
                    return Err(ManifestError::Signature(format!(
                        "wrong owner for manifest without signature: trusted owner {:?}, manifest {:?}",
                        trusted, owner_raw
                    )));
                }
            }
            Some(header_signer) => {
                let mut possible_owners = vec![header_signer.clone()];
                if !allow_only_primary_key {
                    possible_owners.extend(sig.possible_owners(&header_signer));
                }
                if !possible_owners.iter().any(|fpr| fpr.as_str() == owner_raw) {
                    return Err(ManifestError::WrongOwner {
                        header: header_signer.to_string(),
                        owner: owner_raw.to_string(),
                    });
                }
            }
        }

        schema::validate(&fields, expected)?;
        Ok(Manifest {
            header: Some(header),
            fields,
            body: body.to_vec(),
            local_path: None,
        })
    }

    /// Load and verify a manifest from a file.
    pub fn from_file(
        path: &Path,
        sig: &SigContext,
        expected: Option<ObjectType>,
        trusted_owner: Option<&KeyFingerprint>,
    ) -> Result<Self, ManifestError> {
        let data = std::fs::read(path)?;
        let mut manifest = Self::from_bytes(&data, sig, expected, trusted_owner, false)?;
        manifest.local_path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Import keys from a self-signed user or bridge manifest.
    ///
    /// Before any local trust exists, the manifest is verified against the
    /// pubkey embedded in its own body (first of `pubkeys[]` for users, the
    /// `pubkey` field for bridges); on success those keys are loaded into
    /// the signature context and the verified manifest is returned.
    pub fn verify_and_load_pubkeys(
        data: &[u8],
        sig: &mut SigContext,
    ) -> Result<Self, ManifestError> {
        let (header_data, body) = split_header(data)?;
        let header = Header::from_bytes(header_data)?;
        let signature = header
            .signature
            .clone()
            .ok_or(ManifestError::Unsigned)?;

        let fields = parse_body(body, None)?;
        let object = fields.get("object").and_then(Value::as_str);

        let primary = match object {
            Some("user") => fields
                .get("pubkeys")
                .and_then(Value::as_sequence)
                .and_then(|keys| keys.first())
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ManifestError::Schema("user manifest does not contain any pubkeys".into())
                })?,
            Some("bridge") => fields
                .get("pubkey")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ManifestError::Schema("bridge manifest does not contain a pubkey".into())
                })?,
            other => {
                return Err(ManifestError::Schema(format!(
                    "can only import keys from user or bridge manifests, got {other:?}"
                )))
            }
        };
        let primary = PublicKey::from_hex(primary)
            .map_err(|e| ManifestError::Schema(format!("invalid embedded pubkey: {e}")))?;

        let owner = sig.verify(&signature, body, Some(&primary))?;
        sig.add_pubkey(primary, owner.clone())?;

        if object == Some("user") {
            if let Some(keys) = fields.get("pubkeys").and_then(Value::as_sequence) {
                for key in keys.iter().skip(1).filter_map(Value::as_str) {
                    let pubkey = PublicKey::from_hex(key)
                        .map_err(|e| ManifestError::Schema(format!("invalid pubkey: {e}")))?;
                    sig.add_pubkey(pubkey, owner.clone())?;
                }
            }
        }

        schema::validate(&fields, None)?;
        Ok(Manifest {
            header: Some(header),
            fields,
            body: body.to_vec(),
            local_path: None,
        })
    }

    /// Encrypt (honoring `access` lists) and sign the manifest, replacing
    /// any previous signature. The signed bytes become the new body.
    pub fn encrypt_and_sign(
        &mut self,
        sig: &SigContext,
        encrypt: bool,
    ) -> Result<(), ManifestError> {
        let owner = self.owner()?;

        let out_fields = if encrypt {
            encrypt_fields(&self.fields, sig, &owner)?
        } else {
            self.fields.clone()
        };
        let body = serialize_body(&out_fields)?;
        let signature = sig.sign(&owner, &body)?;

        self.body = body;
        self.header = Some(Header::new(Some(signature)));
        Ok(())
    }

    /// Serialize the manifest, including the signature header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        let header = self.header.as_ref().ok_or(ManifestError::Unsigned)?;
        if header.signature.is_none() {
            return Err(ManifestError::Unsigned);
        }
        let mut out = header.to_bytes();
        out.extend_from_slice(HEADER_SEPARATOR);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// The decrypted cleartext fields. Fails for unverified manifests.
    pub fn fields(&self) -> Result<&Mapping, ManifestError> {
        if self.header.is_none() {
            return Err(ManifestError::Unsigned);
        }
        Ok(&self.fields)
    }

    pub fn owner(&self) -> Result<KeyFingerprint, ManifestError> {
        self.fields
            .get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::Schema("manifest must have an owner".into()))?
            .parse()
            .map_err(|_| ManifestError::Schema("owner is not a key fingerprint".into()))
    }

    pub fn object_type(&self) -> Result<ObjectType, ManifestError> {
        self.fields
            .get("object")
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::Schema("manifest must have an object type".into()))?
            .parse()
    }

    pub fn signer(&self) -> Option<&KeyFingerprint> {
        self.header
            .as_ref()
            .and_then(|h| h.signature.as_ref())
            .map(|s| &s.signer)
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    pub fn set_local_path(&mut self, path: PathBuf) {
        self.local_path = Some(path);
    }
}

/// Canonical body serialization: `serde_yaml` output of the mapping in
/// insertion order, `\n` newlines.
fn serialize_body(fields: &Mapping) -> Result<Vec<u8>, ManifestError> {
    serde_yaml::to_string(fields)
        .map(String::into_bytes)
        .map_err(|e| ManifestError::Parse(format!("cannot serialize manifest body: {e}")))
}

/// Parse body bytes, decrypting `encrypted:` wrappers when a signature
/// context is given. Nested encrypted sub-manifests (inline storages with
/// their own `access`) are decrypted best-effort: an undecryptable one stays
/// as its `encrypted` stub.
fn parse_body(body: &[u8], sig: Option<&SigContext>) -> Result<Mapping, ManifestError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| ManifestError::Parse("manifest body is not UTF-8".into()))?;
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| ManifestError::Parse(format!("manifest parse error: {e}")))?;
    let mut fields = match value {
        Value::Mapping(map) => map,
        _ => return Err(ManifestError::Parse("manifest body must be a mapping".into())),
    };

    if let Some(sig) = sig {
        // the top-level wrapper must decrypt; failure is a hard error
        fields = decrypt_mapping(fields, sig)?;
        fields = fields
            .into_iter()
            .map(|(k, v)| (k, decrypt_nested(v, sig)))
            .collect();
    }
    Ok(fields)
}

fn decrypt_mapping(fields: Mapping, sig: &SigContext) -> Result<Mapping, ManifestError> {
    if fields.len() == 1 && fields.contains_key("encrypted") {
        let payload: EncryptedPayload =
            serde_yaml::from_value(fields.get("encrypted").cloned().unwrap_or(Value::Null))
                .map_err(|_| ManifestError::Parse("encrypted field malformed".into()))?;
        let cleartext = sig.decrypt(&payload)?;
        let text = String::from_utf8(cleartext)
            .map_err(|_| ManifestError::Parse("decrypted body is not UTF-8".into()))?;
        return serde_yaml::from_str(&text)
            .map_err(|e| ManifestError::Parse(format!("decrypted body parse error: {e}")));
    }
    Ok(fields)
}

fn decrypt_nested(value: Value, sig: &SigContext) -> Value {
    match value {
        Value::Mapping(map) => {
            let map = match decrypt_mapping(map.clone(), sig) {
                Ok(decrypted) => decrypted,
                // leave the stub in place; the reader may not be a recipient
                Err(_) => map,
            };
            Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, decrypt_nested(v, sig)))
                    .collect(),
            )
        }
        Value::Sequence(seq) => {
            Value::Sequence(seq.into_iter().map(|v| decrypt_nested(v, sig)).collect())
        }
        other => other,
    }
}

/// Encrypt a cleartext mapping according to its `access` lists.
///
/// User and bridge bodies are never encrypted at the top level (they anchor
/// trust and must stay readable), but their nested access-carrying
/// sub-mappings still are. Everything else encrypts to the owner's keys
/// plus whatever `access` adds; the wildcard entry disables encryption.
fn encrypt_fields(
    fields: &Mapping,
    sig: &SigContext,
    owner: &KeyFingerprint,
) -> Result<Mapping, ManifestError> {
    let mut out = Mapping::new();
    for (key, value) in fields {
        out.insert(key.clone(), encrypt_nested(value.clone(), sig, owner)?);
    }

    let object = out.get("object").and_then(Value::as_str);
    if matches!(object, Some("user") | Some("bridge")) {
        return Ok(out);
    }
    encrypt_mapping(out, sig, owner)
}

fn encrypt_nested(
    value: Value,
    sig: &SigContext,
    owner: &KeyFingerprint,
) -> Result<Value, ManifestError> {
    match value {
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (key, nested) in map {
                out.insert(key, encrypt_nested(nested, sig, owner)?);
            }
            if out.contains_key("access") {
                return Ok(Value::Mapping(encrypt_mapping(out, sig, owner)?));
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(|v| encrypt_nested(v, sig, owner))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other),
    }
}

fn encrypt_mapping(
    fields: Mapping,
    sig: &SigContext,
    owner: &KeyFingerprint,
) -> Result<Mapping, ManifestError> {
    // container access lists go through the typed view, which enforces the
    // container invariants before anything is sealed; inline storages and
    // other access-carrying mappings parse the same typed entries directly
    let entries = match fields.get("object").and_then(Value::as_str) {
        Some("container") => {
            let container = crate::obj::Container::try_from(Manifest::from_fields(fields.clone())?)?;
            container.access_subjects().to_vec()
        }
        _ => crate::obj::parse_access(fields.get("access"))?,
    };

    let mut recipients = sig.pubkeys_for(owner);
    for entry in &entries {
        match entry {
            // fully public: no encryption at all
            AccessEntry::Wildcard => return Ok(fields),
            AccessEntry::User(user) if user == owner => {}
            AccessEntry::User(user) => {
                let keys = sig.pubkeys_for(user);
                if keys.is_empty() {
                    return Err(ManifestError::Encrypt(format!("cannot encrypt to {user}")));
                }
                recipients.extend(keys);
            }
            // user-path entries carry the keys they resolved to when the
            // access list was built
            AccessEntry::UserPath { path, pubkeys } => {
                if pubkeys.is_empty() {
                    return Err(ManifestError::Encrypt(format!(
                        "cannot encrypt to unresolved user-path {path:?}"
                    )));
                }
                recipients.extend(pubkeys.iter().copied());
            }
        }
    }

    recipients.sort_by_key(PublicKey::to_bytes);
    recipients.dedup();
    if recipients.is_empty() {
        return Err(ManifestError::Encrypt(format!(
            "no known keys for owner {owner}"
        )));
    }

    let cleartext = serialize_body(&fields)?;
    let payload = sig
        .encrypt(&cleartext, &recipients)
        .map_err(|e| ManifestError::Encrypt(e.to_string()))?;

    let mut out = Mapping::new();
    out.insert(
        Value::String("encrypted".into()),
        serde_yaml::to_value(payload)
            .map_err(|e| ManifestError::Parse(format!("cannot serialize payload: {e}")))?,
    );
    Ok(out)
}
