//! Known-answer tests for the value encryption format.

use hex_literal::hex;

use sealbox_core::error::Error;
use sealbox_core::{Cipher, Value};

const KAT_CIPHERTEXT: &str =
    "ENC[AES256_GCM,data:oYyi,iv:MyIDYbT718JRr11QtBkcj3Dwm4k1aCGZBVeZf0EyV8o=,tag:t5z2Z023Up0kxwCgw1gNxg==,type:str]";

fn kat_key() -> [u8; 32] {
    hex!("6666666666666666666666666666666666666666666666666666666666666666")
}

#[test]
fn kat_decrypt_known_value() {
    let mut cipher = Cipher::new();
    let plaintext = cipher.decrypt(KAT_CIPHERTEXT, &kat_key(), "bar:").unwrap();
    assert_eq!(plaintext, Value::String("foo".into()));
}

#[test]
fn kat_wrong_aad_fails_authentication() {
    let mut cipher = Cipher::new();
    let err = cipher.decrypt(KAT_CIPHERTEXT, &kat_key(), "").unwrap_err();
    assert!(matches!(err, Error::AeadVerifyFailed));
}

#[test]
fn kat_stash_reproduces_published_bytes() {
    // Decrypting stashes the IV, so re-encrypting the same value at
    // the same path must reproduce the published ciphertext exactly.
    let mut cipher = Cipher::new();
    let _ = cipher.decrypt(KAT_CIPHERTEXT, &kat_key(), "bar:").unwrap();
    let sealed = cipher
        .encrypt(&Value::String("foo".into()), &kat_key(), "bar:")
        .unwrap();
    assert_eq!(sealed, KAT_CIPHERTEXT);
}

#[test]
fn kat_tampered_data_fails_authentication() {
    // "oYyi" -> "oYyj" flips bits inside the data segment.
    let tampered = KAT_CIPHERTEXT.replace("data:oYyi", "data:oYyj");
    let mut cipher = Cipher::new();
    let err = cipher.decrypt(&tampered, &kat_key(), "bar:").unwrap_err();
    assert!(matches!(err, Error::AeadVerifyFailed));
}

#[test]
fn kat_truncated_iv_is_bad_format() {
    // A 12-byte IV is the standard GCM size and must be rejected; the
    // format pins 32 bytes.
    let short_iv = "ENC[AES256_GCM,data:oYyi,iv:AAAAAAAAAAAAAAAA,tag:t5z2Z023Up0kxwCgw1gNxg==,type:str]";
    let mut cipher = Cipher::new();
    let err = cipher.decrypt(short_iv, &kat_key(), "bar:").unwrap_err();
    assert!(matches!(err, Error::BadFormat(_)));
}
