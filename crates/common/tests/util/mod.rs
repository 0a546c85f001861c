//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use serde_yaml::Mapping;
use tempfile::TempDir;

use common::config::Config;
use common::crypto::{KeyFingerprint, SigContext};
use common::ctx::Context;
use common::manifest::Manifest;

/// A scratch Wildland home: config + key dir + catalog under a temp dir.
pub struct Home {
    pub dir: TempDir,
    pub ctx: Arc<Context>,
}

pub fn home() -> Home {
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path());
    let ctx = Context::with_config(config);
    Home { dir, ctx }
}

/// A home whose key is already generated and wired up as `@default` /
/// `@default-owner`, the way `user create` leaves a fresh install.
pub fn home_with_default() -> (Home, KeyFingerprint) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::new(dir.path());
    let fpr = {
        let mut sig = SigContext::new(config.key_dir());
        sig.generate().unwrap()
    };
    config.default = Some(fpr.clone());
    config.default_owner = Some(fpr.clone());
    let ctx = Context::with_config(config);
    (Home { dir, ctx }, fpr)
}

/// Generate a key and a signed user manifest, stored in the home's catalog.
pub fn make_user(home: &Home, name: &str, user_path: &str) -> KeyFingerprint {
    let fpr = home.ctx.sig.write().generate().unwrap();
    let manifest = user_manifest(&home.ctx.sig.read(), &fpr, user_path);
    home.ctx.catalog.save(name, &manifest).unwrap();
    fpr
}

pub fn user_manifest(sig: &SigContext, fpr: &KeyFingerprint, user_path: &str) -> Manifest {
    let pubkey = sig.pubkey(fpr).unwrap().to_hex();
    user_manifest_with_catalog(sig, fpr, user_path, "[]", &pubkey)
}

pub fn user_manifest_with_catalog(
    sig: &SigContext,
    fpr: &KeyFingerprint,
    user_path: &str,
    catalog_yaml: &str,
    pubkey: &str,
) -> Manifest {
    let fields: Mapping = serde_yaml::from_str(&format!(
        "version: \"1\"\nobject: user\nowner: \"{fpr}\"\npaths: [{user_path}]\n\
         pubkeys: [\"{pubkey}\"]\nmanifests-catalog: {catalog_yaml}\n"
    ))
    .unwrap();
    let mut manifest = Manifest::from_fields(fields).unwrap();
    manifest.encrypt_and_sign(sig, false).unwrap();
    manifest
}

/// A signed user manifest with `members` grants (each a wildland user-path
/// whose keys may sign on this user's behalf).
pub fn user_manifest_with_members(
    sig: &SigContext,
    fpr: &KeyFingerprint,
    user_path: &str,
    members_yaml: &str,
    pubkey: &str,
) -> Manifest {
    let fields: Mapping = serde_yaml::from_str(&format!(
        "version: \"1\"\nobject: user\nowner: \"{fpr}\"\npaths: [{user_path}]\n\
         pubkeys: [\"{pubkey}\"]\nmanifests-catalog: []\nmembers: {members_yaml}\n"
    ))
    .unwrap();
    let mut manifest = Manifest::from_fields(fields).unwrap();
    manifest.encrypt_and_sign(sig, false).unwrap();
    manifest
}

/// A signed container manifest with a memory storage.
pub fn container_manifest(
    sig: &SigContext,
    owner: &KeyFingerprint,
    uuid: &str,
    extra_paths: &[&str],
    location: &str,
) -> Manifest {
    let paths = std::iter::once(format!("\"/.uuid/{uuid}\""))
        .chain(extra_paths.iter().map(|p| format!("\"{p}\"")))
        .collect::<Vec<_>>()
        .join(", ");
    let fields: Mapping = serde_yaml::from_str(&format!(
        "version: \"1\"\nobject: container\nowner: \"{owner}\"\npaths: [{paths}]\n\
         backends:\n  storage:\n    - type: memory\n      location: {location}\n"
    ))
    .unwrap();
    let mut manifest = Manifest::from_fields(fields).unwrap();
    manifest.encrypt_and_sign(sig, false).unwrap();
    manifest
}

/// A signed bridge manifest pointing at a user manifest file on disk.
pub fn bridge_manifest(
    sig: &SigContext,
    owner: &KeyFingerprint,
    bridge_path: &str,
    user_file: &Path,
    user_pubkey_hex: &str,
) -> Manifest {
    let fields: Mapping = serde_yaml::from_str(&format!(
        "version: \"1\"\nobject: bridge\nowner: \"{owner}\"\n\
         user: \"file://{}\"\npubkey: \"{user_pubkey_hex}\"\npaths: [{bridge_path}]\n",
        user_file.display()
    ))
    .unwrap();
    let mut manifest = Manifest::from_fields(fields).unwrap();
    manifest.encrypt_and_sign(sig, false).unwrap();
    manifest
}

/// Unique memory-pool name per test to keep pooled trees isolated.
pub fn pool_name(tag: &str) -> String {
    format!("{tag}-{}", uuid::Uuid::new_v4())
}
