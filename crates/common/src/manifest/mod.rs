//! Signed, optionally encrypted manifests
//!
//! Every persisted Wildland object is a [`Manifest`]: a signature header and
//! a YAML body. Loading verifies the signature over the exact body bytes,
//! transparently decrypts `encrypted:` bodies with any locally available
//! secret key, gates on the pinned schema version, and validates the field
//! shape for the object type.
//!
//! The canonical byte form covered by the signature is the `serde_yaml`
//! serialization of the field mapping at signing time; those bytes are
//! carried verbatim by the envelope and never re-serialized on write.

mod codec;
mod header;
mod schema;

pub use codec::{Manifest, ManifestError};
pub use header::{split_header, Header, HEADER_SEPARATOR};
pub use schema::{validate, ObjectType};

pub(crate) use schema::validate_access as schema_validate_access;

/// The only schema version this implementation reads or writes.
pub const CURRENT_VERSION: &str = "1";
