use std::fmt;
use std::str::FromStr;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of an Ed25519 private key in bytes
pub const SECRET_KEY_SIZE: usize = 32;
/// Size of an Ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Identifier of a signing key, and by extension of a user.
///
/// The fingerprint is `0x` followed by the lowercase hex BLAKE3 digest of the
/// raw public key bytes. It is the form keys take everywhere outside the
/// crypto layer: manifest `owner` fields, key file names, access lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    /// Compute the fingerprint of a public key.
    pub fn of(pubkey: &PublicKey) -> Self {
        let digest = blake3::hash(&pubkey.to_bytes());
        KeyFingerprint(format!("0x{}", hex::encode(digest.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for KeyFingerprint {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, KeyError> {
        let hex_part = s
            .strip_prefix("0x")
            .ok_or_else(|| anyhow::anyhow!("fingerprint must start with 0x"))?;
        if hex_part.is_empty() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow::anyhow!("fingerprint is not a hex string: {}", s).into());
        }
        Ok(KeyFingerprint(s.to_ascii_lowercase()))
    }
}

/// Public half of an Ed25519 keypair
///
/// Serves two purposes:
/// - **Signature verification** for manifests signed by the matching secret key
/// - **Key wrapping**: converted to X25519 for the ECDH step of manifest
///   encryption
///
/// In manifests a public key is written as its 64-character lowercase hex
/// form (`pubkeys` in user manifests, `pubkey` in bridges).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        PublicKey(key)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid public key size, expected {}, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut buff = [0; PUBLIC_KEY_SIZE];
        buff.copy_from_slice(bytes);
        let key = VerifyingKey::from_bytes(&buff)
            .map_err(|_| anyhow::anyhow!("invalid public key bytes"))?;
        Ok(PublicKey(key))
    }
}

impl PublicKey {
    /// Parse a public key from a hexadecimal string.
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let mut buff = [0; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(hex_str, &mut buff)
            .map_err(|_| anyhow::anyhow!("public key hex decode error"))?;
        PublicKey::try_from(&buff[..])
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Fingerprint of this key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        KeyFingerprint::of(self)
    }

    /// Convert the Ed25519 public key to X25519 (Montgomery curve) for ECDH.
    ///
    /// Manifest encryption wraps symmetric keys with ECDH-derived secrets;
    /// Ed25519 lives on the Edwards curve, so the point is mapped to its
    /// Montgomery form first.
    pub(crate) fn to_x25519(&self) -> Result<X25519PublicKey, KeyError> {
        let edwards_point = CompressedEdwardsY::from_slice(&self.to_bytes())
            .map_err(|_| anyhow::anyhow!("public key invalid edwards point"))?
            .decompress()
            .ok_or_else(|| anyhow::anyhow!("public key failed to decompress edwards point"))?;
        Ok(X25519PublicKey::from(
            edwards_point.to_montgomery().to_bytes(),
        ))
    }

    /// Verify an Ed25519 signature over a message.
    pub fn verify(
        &self,
        msg: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        self.0.verify_strict(msg, signature)
    }
}

/// Secret half of an Ed25519 keypair
///
/// Key files live in the configured key directory as `<fpr>.sec` (PEM,
/// mode 0600) next to the matching `<fpr>.pub` (hex). The underlying
/// `SigningKey` zeroizes its scalar on drop.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log key material
        write!(f, "SecretKey({})", self.public().fingerprint())
    }
}

impl From<[u8; SECRET_KEY_SIZE]> for SecretKey {
    fn from(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(SigningKey::from_bytes(&secret))
    }
}

impl SecretKey {
    /// Generate a new random secret key using a cryptographically secure RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("failed to generate random bytes");
        Self::from(bytes)
    }

    /// Parse a secret key from a hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let mut buff = [0; SECRET_KEY_SIZE];
        hex::decode_to_slice(hex_str, &mut buff)
            .map_err(|_| anyhow::anyhow!("secret key hex decode error"))?;
        Ok(Self::from(buff))
    }

    /// Derive the public key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Encode the secret key in PEM form for the key directory.
    pub fn to_pem(&self) -> String {
        let pem = pem::Pem::new("PRIVATE KEY", self.to_bytes().to_vec());
        pem::encode(&pem)
    }

    /// Parse a secret key from PEM form.
    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        if pem.tag() != "PRIVATE KEY" {
            return Err(anyhow::anyhow!("invalid PEM tag, expected PRIVATE KEY").into());
        }
        let contents = pem.contents();
        if contents.len() != SECRET_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid secret key size in PEM, expected {}, got {}",
                SECRET_KEY_SIZE,
                contents.len()
            )
            .into());
        }
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        bytes.copy_from_slice(contents);
        Ok(Self::from(bytes))
    }

    /// Convert the Ed25519 secret key to X25519 for ECDH.
    ///
    /// The clamped scalar of the Ed25519 key is used directly as the X25519
    /// private key, mirroring the public-side Edwards→Montgomery map.
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.0.to_scalar_bytes())
    }

    /// Sign a message, producing a detached Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        use ed25519_dalek::Signer;
        self.0.sign(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();

        let public_hex = public_key.to_hex();
        let recovered = PublicKey::from_hex(&public_hex).unwrap();
        assert_eq!(public_key.to_bytes(), recovered.to_bytes());
    }

    #[test]
    fn test_fingerprint_shape() {
        let fpr = SecretKey::generate().public().fingerprint();
        assert!(fpr.as_str().starts_with("0x"));
        assert_eq!(fpr.as_str().len(), 2 + 64);
        assert_eq!(fpr, fpr.as_str().parse().unwrap());
    }

    #[test]
    fn test_pem_round_trip() {
        let secret_key = SecretKey::generate();
        let pem = secret_key.to_pem();
        let recovered = SecretKey::from_pem(&pem).unwrap();
        assert_eq!(secret_key.to_bytes(), recovered.to_bytes());
        assert_eq!(
            secret_key.public().to_bytes(),
            recovered.public().to_bytes()
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();
        let message = b"hello, world!";

        let signature = secret_key.sign(message);
        assert!(public_key.verify(message, &signature).is_ok());

        assert!(public_key.verify(b"hello, world?", &signature).is_err());

        let other_key = SecretKey::generate().public();
        assert!(other_key.verify(message, &signature).is_err());
    }
}
