//! Signature context: the bridge between the key directory and the
//! manifest codec
//!
//! A [`SigContext`] owns every key the process knows about: secret keys
//! loaded from `<key-dir>/<fpr>.sec`, public keys from `<fpr>.pub`, and
//! additional verification keys registered at runtime (a user manifest may
//! list auxiliary `pubkeys`, and `members` lend keys across owners).
//!
//! A "dummy" mode replaces sign / verify / encrypt with identity transforms
//! for test suites. It is opt-in via config and never interoperates with
//! real material: a dummy context rejects real signatures and vice versa.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::cipher::{CipherError, EncryptedPayload, Secret, WrappedKey};
use super::keys::{KeyFingerprint, PublicKey, SecretKey};

const DUMMY_PREFIX: &str = "dummy.";

/// Errors from signature and key-store operations
#[derive(Debug, thiserror::Error)]
pub enum SigError {
    #[error("key not found: {0}")]
    KeyMissing(KeyFingerprint),
    #[error("signature verification failed: {0}")]
    Signature(String),
    #[error("cannot decrypt: {0}")]
    Decrypt(String),
    #[error("refusing to mix dummy and real cryptographic material")]
    Untrusted,
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("key I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("key error: {0}")]
    Key(#[from] super::keys::KeyError),
}

/// A detached manifest signature: signer fingerprint plus base64 signature
/// bytes, written in the header as `<fpr>:<base64>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signer: KeyFingerprint,
    pub value: String,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.signer, self.value)
    }
}

impl FromStr for Signature {
    type Err = SigError;

    fn from_str(s: &str) -> Result<Self, SigError> {
        let (signer, value) = s
            .split_once(':')
            .ok_or_else(|| SigError::Malformed(format!("expected <fpr>:<signature>: {s}")))?;
        let signer = signer
            .trim()
            .parse()
            .map_err(|_| SigError::Malformed(format!("bad signer fingerprint: {signer}")))?;
        Ok(Signature {
            signer,
            value: value.trim().to_string(),
        })
    }
}

/// Keypair store and signing/encryption engine
pub struct SigContext {
    key_dir: PathBuf,
    secret_keys: HashMap<KeyFingerprint, SecretKey>,
    public_keys: HashMap<KeyFingerprint, PublicKey>,
    /// key fingerprint → owners allowed to sign with it
    key_owners: HashMap<KeyFingerprint, HashSet<KeyFingerprint>>,
    dummy: bool,
}

impl fmt::Debug for SigContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigContext")
            .field("key_dir", &self.key_dir)
            .field("secret_keys", &self.secret_keys.len())
            .field("public_keys", &self.public_keys.len())
            .field("dummy", &self.dummy)
            .finish()
    }
}

impl SigContext {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            secret_keys: HashMap::new(),
            public_keys: HashMap::new(),
            key_owners: HashMap::new(),
            dummy: false,
        }
    }

    /// Create a context whose operations are identity transforms. Test use
    /// only; enabled through the `dummy` config option.
    pub fn dummy(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            dummy: true,
            ..Self::new(key_dir)
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Generate a fresh keypair, persist it into the key directory and load
    /// it into the context. Returns the new key's fingerprint.
    pub fn generate(&mut self) -> Result<KeyFingerprint, SigError> {
        let secret = SecretKey::generate();
        let public = secret.public();
        let fpr = public.fingerprint();

        std::fs::create_dir_all(&self.key_dir)?;
        let pub_path = self.key_dir.join(format!("{fpr}.pub"));
        let sec_path = self.key_dir.join(format!("{fpr}.sec"));
        std::fs::write(&pub_path, public.to_hex())?;
        std::fs::write(&sec_path, secret.to_pem())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&sec_path, std::fs::Permissions::from_mode(0o600))?;
        }

        self.install(fpr.clone(), public, Some(secret));
        Ok(fpr)
    }

    /// Load every keypair present in the key directory.
    pub fn load_dir(&mut self) -> Result<(), SigError> {
        let Ok(entries) = std::fs::read_dir(&self.key_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(fpr) = name.to_string_lossy().strip_suffix(".pub").map(str::to_string) else {
                continue;
            };
            match fpr.parse::<KeyFingerprint>() {
                Ok(fpr) => self.load_key(&fpr)?,
                Err(_) => tracing::warn!("ignoring odd key file: {:?}", name),
            }
        }
        Ok(())
    }

    /// Load a keypair (or just the public half) from the key directory.
    pub fn load_key(&mut self, fpr: &KeyFingerprint) -> Result<(), SigError> {
        let pub_path = self.key_dir.join(format!("{fpr}.pub"));
        if !pub_path.exists() {
            return Err(SigError::KeyMissing(fpr.clone()));
        }
        let public = PublicKey::from_hex(std::fs::read_to_string(&pub_path)?.trim())?;

        let sec_path = self.key_dir.join(format!("{fpr}.sec"));
        let secret = if sec_path.exists() {
            Some(SecretKey::from_pem(&std::fs::read_to_string(&sec_path)?)?)
        } else {
            None
        };

        self.install(fpr.clone(), public, secret);
        Ok(())
    }

    /// Register an additional verification key for an owner (e.g. an
    /// auxiliary entry of a user manifest's `pubkeys`, or a key lent through
    /// `members`). Returns the registered key's fingerprint.
    pub fn add_pubkey(
        &mut self,
        pubkey: PublicKey,
        owner: KeyFingerprint,
    ) -> Result<KeyFingerprint, SigError> {
        let fpr = pubkey.fingerprint();
        self.public_keys.insert(fpr.clone(), pubkey);
        self.key_owners.entry(fpr.clone()).or_default().insert(owner);
        Ok(fpr)
    }

    /// Owners that are allowed to sign with the given key, beyond the key's
    /// own fingerprint.
    pub fn possible_owners(&self, signer: &KeyFingerprint) -> Vec<KeyFingerprint> {
        let mut owners: Vec<_> = self
            .key_owners
            .get(signer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }

    pub fn has_secret(&self, fpr: &KeyFingerprint) -> bool {
        self.secret_keys.contains_key(fpr)
    }

    pub fn pubkey(&self, fpr: &KeyFingerprint) -> Option<&PublicKey> {
        self.public_keys.get(fpr)
    }

    /// All known verification keys usable by the given owner: the owner's
    /// own key plus any key registered for it via [`SigContext::add_pubkey`].
    pub fn pubkeys_for(&self, owner: &KeyFingerprint) -> Vec<PublicKey> {
        let mut keys = Vec::new();
        if let Some(key) = self.public_keys.get(owner) {
            keys.push(*key);
        }
        for (fpr, owners) in &self.key_owners {
            if owners.contains(owner) {
                if let Some(key) = self.public_keys.get(fpr) {
                    if !keys.contains(key) {
                        keys.push(*key);
                    }
                }
            }
        }
        keys
    }

    /// Sign bytes with the owner's secret key.
    pub fn sign(&self, owner: &KeyFingerprint, data: &[u8]) -> Result<Signature, SigError> {
        if self.dummy {
            return Ok(Signature {
                signer: owner.clone(),
                value: format!("{DUMMY_PREFIX}{owner}"),
            });
        }
        let secret = self
            .secret_keys
            .get(owner)
            .ok_or_else(|| SigError::KeyMissing(owner.clone()))?;
        Ok(Signature {
            signer: owner.clone(),
            value: BASE64.encode(secret.sign(data).to_bytes()),
        })
    }

    /// Verify a detached signature over bytes, returning the signer.
    ///
    /// `pubkey` short-circuits the key store for self-signed imports, where
    /// the key comes from the manifest body itself.
    pub fn verify(
        &self,
        signature: &Signature,
        data: &[u8],
        pubkey: Option<&PublicKey>,
    ) -> Result<KeyFingerprint, SigError> {
        let is_dummy_sig = signature.value.starts_with(DUMMY_PREFIX);
        if self.dummy != is_dummy_sig {
            return Err(SigError::Untrusted);
        }
        if self.dummy {
            if signature.value != format!("{DUMMY_PREFIX}{}", signature.signer) {
                return Err(SigError::Signature("dummy signature mismatch".into()));
            }
            return Ok(signature.signer.clone());
        }

        let key = match pubkey {
            Some(key) => key,
            None => self
                .public_keys
                .get(&signature.signer)
                .ok_or_else(|| SigError::KeyMissing(signature.signer.clone()))?,
        };

        let sig_bytes: [u8; 64] = BASE64
            .decode(&signature.value)
            .map_err(|e| SigError::Malformed(format!("signature base64: {e}")))?
            .try_into()
            .map_err(|_| SigError::Malformed("signature must be 64 bytes".into()))?;

        key.verify(data, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
            .map_err(|e| SigError::Signature(e.to_string()))?;
        Ok(key.fingerprint())
    }

    /// Encrypt cleartext to a set of recipients: one symmetric encryption of
    /// the data, one wrapped key per recipient.
    pub fn encrypt(
        &self,
        data: &[u8],
        recipients: &[PublicKey],
    ) -> Result<EncryptedPayload, SigError> {
        if recipients.is_empty() {
            return Err(SigError::Decrypt("no recipients to encrypt to".into()));
        }
        if self.dummy {
            return Ok(EncryptedPayload {
                encrypted_data: BASE64.encode(data),
                encrypted_keys: recipients.iter().map(|_| DUMMY_PREFIX.to_string()).collect(),
            });
        }

        let secret = Secret::generate();
        let encrypted_data = BASE64.encode(secret.encrypt(data)?);
        let mut encrypted_keys = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let wrapped = WrappedKey::new(&secret, recipient)?;
            encrypted_keys.push(BASE64.encode(wrapped.to_bytes()));
        }
        Ok(EncryptedPayload {
            encrypted_data,
            encrypted_keys,
        })
    }

    /// Decrypt an encrypted payload with any locally available secret key.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, SigError> {
        let any_dummy = payload.encrypted_keys.iter().any(|k| k == DUMMY_PREFIX);
        if self.dummy != any_dummy && !payload.encrypted_keys.is_empty() {
            return Err(SigError::Untrusted);
        }
        if self.dummy {
            return BASE64
                .decode(&payload.encrypted_data)
                .map_err(|e| SigError::Decrypt(format!("payload base64: {e}")));
        }

        let data = BASE64
            .decode(&payload.encrypted_data)
            .map_err(|e| SigError::Decrypt(format!("payload base64: {e}")))?;

        for encoded in &payload.encrypted_keys {
            let Ok(bytes) = BASE64.decode(encoded) else {
                continue;
            };
            let Ok(wrapped) = WrappedKey::try_from(bytes.as_slice()) else {
                continue;
            };
            for secret_key in self.secret_keys.values() {
                if let Ok(secret) = wrapped.recover(secret_key) {
                    return secret
                        .decrypt(&data)
                        .map_err(|e| SigError::Decrypt(e.to_string()));
                }
            }
        }
        Err(SigError::Decrypt(
            "decryption key unavailable for any wrapped key".into(),
        ))
    }

    fn install(&mut self, fpr: KeyFingerprint, public: PublicKey, secret: Option<SecretKey>) {
        self.public_keys.insert(fpr.clone(), public);
        if let Some(secret) = secret {
            self.secret_keys.insert(fpr, secret);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> (SigContext, TempDir) {
        let dir = TempDir::new().unwrap();
        (SigContext::new(dir.path().join("keys")), dir)
    }

    #[test]
    fn test_generate_sign_verify() {
        let (mut sig, _dir) = ctx();
        let fpr = sig.generate().unwrap();

        let signature = sig.sign(&fpr, b"body").unwrap();
        assert_eq!(sig.verify(&signature, b"body", None).unwrap(), fpr);
        assert!(sig.verify(&signature, b"tampered", None).is_err());
    }

    #[test]
    fn test_key_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let key_dir = dir.path().join("keys");

        let fpr = {
            let mut sig = SigContext::new(&key_dir);
            sig.generate().unwrap()
        };

        // a fresh context can load and use the persisted keys
        let mut sig = SigContext::new(&key_dir);
        sig.load_key(&fpr).unwrap();
        assert!(sig.has_secret(&fpr));
        let signature = sig.sign(&fpr, b"data").unwrap();
        assert_eq!(sig.verify(&signature, b"data", None).unwrap(), fpr);
    }

    #[test]
    fn test_encrypt_for_multiple_recipients() {
        let (mut alice, _a) = ctx();
        let (mut bob, _b) = ctx();
        let (mut eve, _e) = ctx();
        let alice_fpr = alice.generate().unwrap();
        let bob_fpr = bob.generate().unwrap();
        eve.generate().unwrap();

        let recipients = vec![
            *alice.pubkey(&alice_fpr).unwrap(),
            *bob.pubkey(&bob_fpr).unwrap(),
        ];
        let payload = alice.encrypt(b"secret body", &recipients).unwrap();
        assert_eq!(payload.encrypted_keys.len(), 2);

        assert_eq!(alice.decrypt(&payload).unwrap(), b"secret body");
        assert_eq!(bob.decrypt(&payload).unwrap(), b"secret body");
        assert!(matches!(eve.decrypt(&payload), Err(SigError::Decrypt(_))));
    }

    #[test]
    fn test_dummy_mode_is_isolated() {
        let dir = TempDir::new().unwrap();
        let mut real = SigContext::new(dir.path().join("real"));
        let real_fpr = real.generate().unwrap();
        let real_sig = real.sign(&real_fpr, b"data").unwrap();

        let mut dummy = SigContext::dummy(dir.path().join("dummy"));
        let dummy_fpr = dummy.generate().unwrap();
        let dummy_sig = dummy.sign(&dummy_fpr, b"data").unwrap();

        // dummy signatures verify only in dummy contexts
        assert!(dummy.verify(&dummy_sig, b"data", None).is_ok());
        assert!(matches!(
            real.verify(&dummy_sig, b"data", None),
            Err(SigError::Untrusted)
        ));
        assert!(matches!(
            dummy.verify(&real_sig, b"data", None),
            Err(SigError::Untrusted)
        ));
    }

    #[test]
    fn test_possible_owners() {
        let (mut sig, _dir) = ctx();
        let owner = sig.generate().unwrap();
        let aux = SecretKey::generate().public();
        let aux_fpr = sig.add_pubkey(aux, owner.clone()).unwrap();

        assert_eq!(sig.possible_owners(&aux_fpr), vec![owner.clone()]);
        assert_eq!(sig.pubkeys_for(&owner).len(), 2);
    }
}
