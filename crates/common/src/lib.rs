pub mod catalog;
pub mod config;
pub mod control;
pub mod ctx;
/**
 * Cryptographic types and operations.
 *  - Public and private key implementations
 *  - Detached manifest signatures
 *  - Per-recipient key wrapping for encrypted manifests
 */
pub mod crypto;
/**
 * Signed manifest envelope: header parsing,
 *  canonical serialization, schema validation
 *  and transparent decrypt-on-load.
 */
pub mod manifest;
/**
 * Typed views over validated manifests
 *  (user, container, storage, bridge, link,
 *  template) with invariant enforcement.
 */
pub mod obj;
/**
 * Wildland path resolution: walks bridges
 *  across users' manifest catalogs into
 *  concrete container and user manifests.
 */
pub mod resolver;
/**
 * Storage backend contract and the built-in
 *  local / memory drivers, plus the polling
 *  watcher substitute for drivers without a
 *  native one.
 */
pub mod storage;
pub mod wlpath;

pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::config::Config;
    pub use crate::ctx::Context;
    pub use crate::crypto::{KeyFingerprint, PublicKey, SecretKey, SigContext};
    pub use crate::manifest::{Manifest, ManifestError};
    pub use crate::obj::{Bridge, Container, Storage, User};
    pub use crate::resolver::Resolver;
    pub use crate::storage::{BackendRegistry, StorageBackend};
    pub use crate::wlpath::WildlandPath;
}
