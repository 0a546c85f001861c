//! Cryptographic primitives for the manifest layer
//!
//! Three layers build on each other:
//!
//! - **[`keys`]**: Ed25519 keypairs identified by a [`KeyFingerprint`],
//!   with the Edwards→Montgomery conversion needed for ECDH
//! - **[`cipher`]**: symmetric content encryption ([`Secret`]) and
//!   per-recipient key wrapping ([`WrappedKey`])
//! - **[`sig`]**: the [`SigContext`] tying both to an on-disk key
//!   directory, used by the manifest codec for sign / verify /
//!   encrypt / decrypt

mod cipher;
mod keys;
mod sig;

pub use cipher::{CipherError, EncryptedPayload, Secret, WrappedKey, NONCE_SIZE, SECRET_SIZE};
pub use keys::{KeyError, KeyFingerprint, PublicKey, SecretKey, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
pub use sig::{SigContext, SigError, Signature};
