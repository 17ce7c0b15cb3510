//! Key chain loading tests
//!
//! Loads key tables from a keys directory the way the binary does at startup.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use shard_proxy::crypto::{KeyId, KeyMaterial, SessionId};
use shard_proxy::{KeyChain, ProxyError};

fn write_keys(dir: &Path, statics: &str, sessions: &str) {
    fs::write(dir.join("static_keys.json"), statics).unwrap();
    fs::write(dir.join("session_keys.json"), sessions).unwrap();
}

/// Test loading well-formed key files
#[test]
fn test_load_valid_keys() {
    let dir = tempfile::tempdir().unwrap();
    let static_key = STANDARD.encode([0x11u8; 16]);
    let session_key = STANDARD.encode([0x22u8; 32]);
    write_keys(
        dir.path(),
        &format!(r#"{{ "3": "{}", "7": "{}" }}"#, static_key, static_key),
        &format!(r#"{{ "513": "{}" }}"#, session_key),
    );

    let chain = KeyChain::load(dir.path()).unwrap();

    assert_eq!(chain.static_len(), 2);
    assert_eq!(chain.session_len(), 1);
    assert_eq!(chain.lookup_static(KeyId(3)).unwrap().as_bytes(), &[0x11u8; 16]);
    assert_eq!(chain.lookup_session(SessionId(513)).unwrap().as_bytes(), &[0x22u8; 32]);
}

/// Test that client keys are optional and loaded when present
#[test]
fn test_client_keys_file() {
    let dir = tempfile::tempdir().unwrap();
    write_keys(dir.path(), "{}", "{}");
    assert_eq!(KeyChain::load(dir.path()).unwrap().client_len(), 0);

    fs::write(
        dir.path().join("client_keys.json"),
        format!(r#"{{ "3": "{}" }}"#, STANDARD.encode([0x33u8; 16])),
    )
    .unwrap();
    let chain = KeyChain::load(dir.path()).unwrap();
    assert_eq!(chain.client_len(), 1);
    assert_eq!(chain.lookup_client(KeyId(3)).unwrap().as_bytes(), &[0x33u8; 16]);
    assert!(chain.lookup_static(KeyId(3)).is_err());

    // A client key must be a 16-byte key like a static one
    fs::write(
        dir.path().join("client_keys.json"),
        format!(r#"{{ "3": "{}" }}"#, STANDARD.encode([0x33u8; 32])),
    )
    .unwrap();
    assert!(matches!(KeyChain::load(dir.path()), Err(ProxyError::InvalidKey(_))));
}

/// Test that a seeded session binding cannot be replaced
#[test]
fn test_seeded_binding_wins() {
    let dir = tempfile::tempdir().unwrap();
    write_keys(dir.path(), "{}", &format!(r#"{{ "1": "{}" }}"#, STANDARD.encode([1u8; 32])));

    let chain = KeyChain::load(dir.path()).unwrap();
    let bound = chain.bind_session(SessionId(1), KeyMaterial::new(vec![9u8; 32]));

    assert_eq!(bound.as_bytes(), &[1u8; 32]);
}

/// Test that a missing key file is reported
#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("static_keys.json"), "{}").unwrap();

    assert!(KeyChain::load(dir.path()).is_err());
}

/// Test that malformed key files are rejected
#[test]
fn test_malformed_files() {
    let good_static = format!(r#"{{ "1": "{}" }}"#, STANDARD.encode([0u8; 16]));

    let cases = [
        // Not JSON
        (good_static.clone(), "not json".to_string()),
        // Non-numeric id
        (format!(r#"{{ "abc": "{}" }}"#, STANDARD.encode([0u8; 16])), "{}".to_string()),
        // Id out of range for a key slot
        (format!(r#"{{ "300": "{}" }}"#, STANDARD.encode([0u8; 16])), "{}".to_string()),
        // Invalid base64
        (r#"{ "1": "***" }"#.to_string(), "{}".to_string()),
        // Session key of the wrong length
        (good_static.clone(), format!(r#"{{ "1": "{}" }}"#, STANDARD.encode([0u8; 16]))),
        // Static key of the wrong length
        (format!(r#"{{ "1": "{}" }}"#, STANDARD.encode([0u8; 32])), "{}".to_string()),
    ];

    for (statics, sessions) in cases {
        let dir = tempfile::tempdir().unwrap();
        write_keys(dir.path(), &statics, &sessions);

        let result = KeyChain::load(dir.path());
        assert!(
            matches!(result, Err(ProxyError::InvalidKey(_))),
            "expected InvalidKey for {} / {}",
            statics,
            sessions
        );
    }
}
