//! Integration tests for the manifest envelope: signing, verification,
//! encryption with access lists, and the trusted-owner escape hatch.

mod util;

use util::{home, user_manifest};

use common::crypto::SigError;
use common::manifest::{Manifest, ManifestError, ObjectType};
use serde_yaml::Mapping;

fn container_fields(owner: &str, access: Option<&str>) -> Mapping {
    let access_line = access.map(|a| format!("access: {a}\n")).unwrap_or_default();
    serde_yaml::from_str(&format!(
        "version: \"1\"\nobject: container\nowner: \"{owner}\"\n\
         paths: [\"/.uuid/5c34712e-e0a8-4b67-9317-9c3dbb1a4282\", /data/notes]\n\
         title: notes\n{access_line}backends:\n  storage:\n    - type: memory\n      location: m\n"
    ))
    .unwrap()
}

#[test]
fn test_sign_and_decode_round_trip() {
    let home = home();
    let fpr = home.ctx.sig.write().generate().unwrap();
    let sig = home.ctx.sig.read();

    let mut manifest = Manifest::from_fields(container_fields(fpr.as_str(), None)).unwrap();
    manifest.encrypt_and_sign(&sig, false).unwrap();
    let bytes = manifest.to_bytes().unwrap();

    let decoded = Manifest::from_bytes(&bytes, &sig, Some(ObjectType::Container), None, false).unwrap();
    assert_eq!(decoded.fields().unwrap(), manifest.fields().unwrap());
    assert_eq!(decoded.owner().unwrap(), fpr);
    assert_eq!(decoded.signer(), Some(&fpr));
}

#[test]
fn test_tampered_body_is_rejected() {
    let home = home();
    let fpr = home.ctx.sig.write().generate().unwrap();
    let sig = home.ctx.sig.read();

    let mut manifest = Manifest::from_fields(container_fields(fpr.as_str(), None)).unwrap();
    manifest.encrypt_and_sign(&sig, false).unwrap();
    let mut bytes = manifest.to_bytes().unwrap();

    let pos = bytes.len() - 10;
    bytes[pos] ^= 0x20;
    let err = Manifest::from_bytes(&bytes, &sig, None, None, false).unwrap_err();
    assert!(matches!(err, ManifestError::Signature(_)), "got {err:?}");
}

#[test]
fn test_access_scoped_encryption() {
    // Alice encrypts a container for herself and Bob; a third party cannot
    // read it, Bob recovers the very same body Alice serialized.
    let alice = home();
    let bob = home();
    let eve = home();
    let alice_fpr = alice.ctx.sig.write().generate().unwrap();
    let bob_fpr = bob.ctx.sig.write().generate().unwrap();
    eve.ctx.sig.write().generate().unwrap();

    let bob_pub = *bob.ctx.sig.read().pubkey(&bob_fpr).unwrap();
    let alice_pub = *alice.ctx.sig.read().pubkey(&alice_fpr).unwrap();

    // everyone can verify alice's signature; only recipients can decrypt
    alice
        .ctx
        .sig
        .write()
        .add_pubkey(bob_pub, bob_fpr.clone())
        .unwrap();
    bob.ctx
        .sig
        .write()
        .add_pubkey(alice_pub, alice_fpr.clone())
        .unwrap();
    eve.ctx
        .sig
        .write()
        .add_pubkey(alice_pub, alice_fpr.clone())
        .unwrap();

    let access = format!("[{{user: \"{bob_fpr}\"}}]");
    let mut manifest =
        Manifest::from_fields(container_fields(alice_fpr.as_str(), Some(&access))).unwrap();
    manifest.encrypt_and_sign(&alice.ctx.sig.read(), true).unwrap();
    let bytes = manifest.to_bytes().unwrap();

    // the wire form hides the cleartext
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(text.contains("encrypted-data"));
    assert!(!text.contains("/data/notes"));

    let from_alice =
        Manifest::from_bytes(&bytes, &alice.ctx.sig.read(), None, None, false).unwrap();
    assert_eq!(from_alice.fields().unwrap(), manifest.fields().unwrap());

    let from_bob = Manifest::from_bytes(&bytes, &bob.ctx.sig.read(), None, None, false).unwrap();
    assert_eq!(from_bob.fields().unwrap(), manifest.fields().unwrap());

    let err = Manifest::from_bytes(&bytes, &eve.ctx.sig.read(), None, None, false).unwrap_err();
    assert!(matches!(err, ManifestError::Unencryptable), "got {err:?}");
}

#[test]
fn test_user_path_access_encrypts_to_cached_keys() {
    // a user-path access entry carries the pubkeys it resolved to when the
    // list was built; encryption goes through the container's typed access
    // view and must reach exactly those keys
    use common::obj::{AccessEntry, Container};
    let alice = home();
    let bob = home();
    let alice_fpr = alice.ctx.sig.write().generate().unwrap();
    let bob_fpr = bob.ctx.sig.write().generate().unwrap();
    let bob_pub = *bob.ctx.sig.read().pubkey(&bob_fpr).unwrap();
    let alice_pub = *alice.ctx.sig.read().pubkey(&alice_fpr).unwrap();
    bob.ctx
        .sig
        .write()
        .add_pubkey(alice_pub, alice_fpr.clone())
        .unwrap();

    let access = format!(
        "[{{user-path: \"wildland:{alice_fpr}:/users/bob:\", pubkeys: [\"{}\"]}}]",
        bob_pub.to_hex()
    );
    let mut manifest =
        Manifest::from_fields(container_fields(alice_fpr.as_str(), Some(&access))).unwrap();
    manifest.encrypt_and_sign(&alice.ctx.sig.read(), true).unwrap();
    let bytes = manifest.to_bytes().unwrap();

    let decoded = {
        let from_bob = Manifest::from_bytes(&bytes, &bob.ctx.sig.read(), None, None, false).unwrap();
        assert_eq!(from_bob.fields().unwrap(), manifest.fields().unwrap());
        Container::try_from(from_bob).unwrap()
    };
    assert!(matches!(
        decoded.access_subjects(),
        [AccessEntry::UserPath { pubkeys, .. }] if pubkeys == &[bob_pub]
    ));

    // an unresolved user-path entry cannot be encrypted to
    let bare = "[{user-path: \"wildland::/users/nobody:\"}]";
    let mut manifest =
        Manifest::from_fields(container_fields(alice_fpr.as_str(), Some(bare))).unwrap();
    let err = manifest
        .encrypt_and_sign(&alice.ctx.sig.read(), true)
        .unwrap_err();
    assert!(matches!(err, ManifestError::Encrypt(_)), "got {err:?}");
}

#[test]
fn test_wildcard_access_forbids_encryption() {
    let home = home();
    let fpr = home.ctx.sig.write().generate().unwrap();
    let sig = home.ctx.sig.read();

    let mut manifest =
        Manifest::from_fields(container_fields(fpr.as_str(), Some("[{user: \"*\"}]"))).unwrap();
    manifest.encrypt_and_sign(&sig, true).unwrap();

    let text = String::from_utf8(manifest.to_bytes().unwrap()).unwrap();
    assert!(text.contains("/data/notes"), "body must stay cleartext");
    assert!(!text.contains("encrypted-data"));
}

#[test]
fn test_unknown_version_is_rejected() {
    let home = home();
    let fpr = home.ctx.sig.write().generate().unwrap();
    let sig = home.ctx.sig.read();

    let mut fields = container_fields(fpr.as_str(), None);
    fields.insert("version".into(), "2".into());
    let mut manifest = Manifest::from_fields(fields).unwrap();
    manifest.encrypt_and_sign(&sig, false).unwrap();
    let bytes = manifest.to_bytes().unwrap();

    let err = Manifest::from_bytes(&bytes, &sig, None, None, false).unwrap_err();
    assert!(matches!(err, ManifestError::Schema(_)), "got {err:?}");
}

#[test]
fn test_unsigned_manifest_needs_trusted_owner() {
    let home = home();
    let (fpr, other) = {
        let mut sig = home.ctx.sig.write();
        (sig.generate().unwrap(), sig.generate().unwrap())
    };
    let sig = home.ctx.sig.read();

    let body = serde_yaml::to_string(&container_fields(fpr.as_str(), None)).unwrap();
    let data = format!("---\n{body}");

    // accepted when the storage owner is trusted
    let manifest =
        Manifest::from_bytes(data.as_bytes(), &sig, None, Some(&fpr), false).unwrap();
    assert_eq!(manifest.owner().unwrap(), fpr);

    // rejected without a trusted owner, or with the wrong one
    assert!(Manifest::from_bytes(data.as_bytes(), &sig, None, None, false).is_err());
    assert!(Manifest::from_bytes(data.as_bytes(), &sig, None, Some(&other), false).is_err());
}

#[test]
fn test_self_signed_user_import() {
    // Bob's manifest arrives with no local trust; the embedded pubkey both
    // verifies the signature and lands in the signature context.
    let bob = home();
    let bob_fpr = bob.ctx.sig.write().generate().unwrap();
    let manifest = user_manifest(&bob.ctx.sig.read(), &bob_fpr, "/users/bob");
    let bytes = manifest.to_bytes().unwrap();

    let alice = home();
    assert!(alice.ctx.sig.read().pubkey(&bob_fpr).is_none());
    let imported = {
        let mut sig = alice.ctx.sig.write();
        Manifest::verify_and_load_pubkeys(&bytes, &mut sig).unwrap()
    };
    assert_eq!(imported.owner().unwrap(), bob_fpr);
    assert!(alice.ctx.sig.read().pubkey(&bob_fpr).is_some());

    // now regular verification works too
    let reloaded = Manifest::from_bytes(&bytes, &alice.ctx.sig.read(), None, None, false).unwrap();
    assert_eq!(reloaded.owner().unwrap(), bob_fpr);
}

#[test]
fn test_dummy_context_rejects_real_signatures() {
    let real = home();
    let fpr = real.ctx.sig.write().generate().unwrap();
    let mut manifest = Manifest::from_fields(container_fields(fpr.as_str(), None)).unwrap();
    manifest.encrypt_and_sign(&real.ctx.sig.read(), false).unwrap();
    let bytes = manifest.to_bytes().unwrap();

    let dummy = common::crypto::SigContext::dummy(real.dir.path().join("dummy-keys"));
    let err = Manifest::from_bytes(&bytes, &dummy, None, None, false).unwrap_err();
    match err {
        ManifestError::Signature(message) => {
            assert_eq!(message, SigError::Untrusted.to_string())
        }
        other => panic!("expected signature error, got {other:?}"),
    }
}
