//! Manifest body encryption
//!
//! An encrypted manifest body is symmetric-encrypted exactly once with a
//! fresh [`Secret`], and the secret is wrapped once per recipient as a
//! [`WrappedKey`]. Both ride inside the `encrypted:` wrapper of the manifest
//! as base64 strings:
//!
//! ```text
//! encrypted:
//!   encrypted-data: <base64: nonce (12) || ciphertext || tag (16)>
//!   encrypted-keys:
//!     - <base64: ephemeral pubkey (32) || AES-KW wrapped secret (40)>
//! ```
//!
//! Wrapping combines ECDH (over X25519-converted Ed25519 keys) with AES Key
//! Wrap: an ephemeral keypair is generated per recipient, the shared secret
//! becomes the KEK, and only the recipient's secret key can re-derive it.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use aes_kw::KekAes256 as Kek;

use super::keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE};

/// Size of the ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of a symmetric key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// AES-KW pads the wrapped key by 8 bytes
const KW_PAD_SIZE: usize = 8;
/// Total size of a wrapped key: ephemeral pubkey (32) || wrapped secret (40)
pub const WRAPPED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + SECRET_SIZE + KW_PAD_SIZE;

/// Errors that can occur during manifest body encryption or decryption
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("cipher error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("none of the wrapped keys match an available secret key")]
    NoMatchingKey,
}

/// A 256-bit symmetric key protecting one manifest body
///
/// The encrypted format is `nonce (12 bytes) || ciphertext || tag (16 bytes)`
/// with a random nonce per encryption, so encrypting the same body twice
/// yields different bytes.
#[derive(Clone, PartialEq)]
pub struct Secret([u8; SECRET_SIZE]);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Generate a new random secret using a cryptographically secure RNG.
    pub fn generate() -> Self {
        let mut buff = [0; SECRET_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Encrypt data with ChaCha20-Poly1305.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).expect("failed to generate random bytes");
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| anyhow::anyhow!("encryption error"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`Secret::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_SIZE {
            return Err(anyhow::anyhow!("ciphertext too short").into());
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption error").into())
    }
}

/// A [`Secret`] wrapped for a single recipient
///
/// Wire format: `ephemeral_pubkey (32 bytes) || wrapped_secret (40 bytes)`.
/// Ephemeral keys are discarded after wrapping, so a captured manifest cannot
/// be decrypted later even if the sender's long-term key leaks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WrappedKey([u8; WRAPPED_KEY_SIZE]);

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedKey({})", hex::encode(&self.0[..8]))
    }
}

impl TryFrom<&[u8]> for WrappedKey {
    type Error = CipherError;

    fn try_from(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != WRAPPED_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid wrapped key size, expected {}, got {}",
                WRAPPED_KEY_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut buff = [0u8; WRAPPED_KEY_SIZE];
        buff.copy_from_slice(bytes);
        Ok(WrappedKey(buff))
    }
}

impl WrappedKey {
    /// Wrap a secret for a recipient.
    ///
    /// Generates an ephemeral Ed25519 keypair, performs ECDH against the
    /// recipient's X25519-converted public key, and AES-KW-wraps the secret
    /// under the shared KEK.
    pub fn new(secret: &Secret, recipient: &PublicKey) -> Result<Self, CipherError> {
        let ephemeral_secret = SecretKey::generate();
        let ephemeral_public = ephemeral_secret.public();

        let shared = ephemeral_secret
            .to_x25519()
            .diffie_hellman(&recipient.to_x25519()?);

        let mut kek_bytes = [0; SECRET_SIZE];
        kek_bytes.copy_from_slice(shared.as_bytes());
        let wrapped = Kek::from(kek_bytes)
            .wrap_vec(secret.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        if PUBLIC_KEY_SIZE + wrapped.len() != WRAPPED_KEY_SIZE {
            return Err(anyhow::anyhow!("unexpected wrapped key size").into());
        }

        let mut out = [0u8; WRAPPED_KEY_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&ephemeral_public.to_bytes());
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&wrapped);
        Ok(WrappedKey(out))
    }

    /// Recover the secret with the recipient's secret key.
    ///
    /// Fails if this key was wrapped for a different recipient or the data
    /// was tampered with (AES-KW authenticates the wrapped block).
    pub fn recover(&self, recipient_secret: &SecretKey) -> Result<Secret, CipherError> {
        let ephemeral_public = PublicKey::try_from(&self.0[..PUBLIC_KEY_SIZE])?;

        let shared = recipient_secret
            .to_x25519()
            .diffie_hellman(&ephemeral_public.to_x25519()?);

        let mut kek_bytes = [0; SECRET_SIZE];
        kek_bytes.copy_from_slice(shared.as_bytes());
        let unwrapped = Kek::from(kek_bytes)
            .unwrap_vec(&self.0[PUBLIC_KEY_SIZE..])
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;

        if unwrapped.len() != SECRET_SIZE {
            return Err(anyhow::anyhow!("unwrapped secret has incorrect size").into());
        }
        let mut secret = [0u8; SECRET_SIZE];
        secret.copy_from_slice(&unwrapped);
        Ok(Secret::from(secret))
    }

    pub fn to_bytes(&self) -> [u8; WRAPPED_KEY_SIZE] {
        self.0
    }
}

/// The two halves of an encrypted manifest body, as base64 strings ready to
/// be embedded in the `encrypted:` wrapper.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedPayload {
    #[serde(rename = "encrypted-data")]
    pub encrypted_data: String,
    #[serde(rename = "encrypted-keys")]
    pub encrypted_keys: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let secret = Secret::generate();
        let plaintext = b"object: container";

        let ciphertext = secret.encrypt(plaintext).unwrap();
        assert_ne!(&ciphertext[NONCE_SIZE..], plaintext.as_slice());

        let recovered = secret.decrypt(&ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_decrypt_with_wrong_secret_fails() {
        let ciphertext = Secret::generate().encrypt(b"data").unwrap();
        assert!(Secret::generate().decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_wrap_and_recover() {
        let secret = Secret::generate();
        let recipient = SecretKey::generate();

        let wrapped = WrappedKey::new(&secret, &recipient.public()).unwrap();
        let recovered = wrapped.recover(&recipient).unwrap();
        assert_eq!(secret, recovered);
    }

    #[test]
    fn test_recover_with_wrong_key_fails() {
        let secret = Secret::generate();
        let recipient = SecretKey::generate();
        let wrapped = WrappedKey::new(&secret, &recipient.public()).unwrap();

        let intruder = SecretKey::generate();
        assert!(wrapped.recover(&intruder).is_err());
    }
}
