//! Leaf-level authenticated encryption.
//!
//! Every scalar leaf is sealed with AES-256-GCM under the per-document
//! data key. The nonce is 32 bytes, not the usual 12; the size is
//! load-bearing for wire compatibility and must never be shortened.
//! The canonical path of the leaf is bound in as associated data, so a
//! ciphertext moved to a different position fails authentication.

use std::collections::HashMap;

use aead::consts::U32;
use aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;

use crate::error::{Error, Result};
use crate::tree::Value;

/// AES-256-GCM constructed with an explicit 32-byte nonce length.
type Aes256Gcm32 = AesGcm<Aes256, U32>;
type Nonce32 = aes_gcm::Nonce<U32>;

pub const DATA_KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

static ENC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ENC\[AES256_GCM,data:(.+),iv:(.+),tag:(.+),type:(.+)\]$").unwrap()
});

/// True when the string is a well-formed encrypted value.
pub fn is_encrypted(value: &str) -> bool {
    ENC_RE.is_match(value)
}

/// Stateful value cipher. The stash maps (plaintext, AAD) pairs seen
/// during decryption to their IVs so an unchanged value re-encrypts to
/// byte-identical ciphertext within the same session. The stash is
/// never persisted.
#[derive(Debug, Default)]
pub struct Cipher {
    stash: HashMap<(Vec<u8>, String), [u8; IV_SIZE]>,
}

impl Cipher {
    pub fn new() -> Self {
        Cipher::default()
    }

    /// Encrypts a typed leaf value, returning the `ENC[...]` string.
    /// Empty strings and empty byte sequences encrypt to the empty
    /// string with no wrapper.
    pub fn encrypt(&mut self, value: &Value, key: &[u8], aad: &str) -> Result<String> {
        let plaintext = value.to_bytes()?;
        if plaintext.is_empty()
            && matches!(
                value,
                Value::String(_) | Value::Bytes(_) | Value::Comment(_)
            )
        {
            return Ok(String::new());
        }

        let iv = match self.stash.get(&(plaintext.clone(), aad.to_string())) {
            Some(iv) => *iv,
            None => {
                let mut iv = [0u8; IV_SIZE];
                OsRng
                    .try_fill_bytes(&mut iv)
                    .map_err(|e| Error::Rng(e.to_string()))?;
                iv
            }
        };

        let aead = aead_for(key)?;
        let sealed = aead
            .encrypt(
                Nonce32::from_slice(&iv),
                Payload {
                    msg: &plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| Error::AeadVerifyFailed)?;
        let (data, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(format!(
            "ENC[AES256_GCM,data:{},iv:{},tag:{},type:{}]",
            BASE64.encode(data),
            BASE64.encode(iv),
            BASE64.encode(tag),
            type_tag(value)?,
        ))
    }

    /// Decrypts an `ENC[...]` string back to its original typed value,
    /// recording the (plaintext, AAD) → IV association for later
    /// re-encryption. The empty string decrypts to the empty string.
    pub fn decrypt(&mut self, ciphertext: &str, key: &[u8], aad: &str) -> Result<Value> {
        if ciphertext.is_empty() {
            return Ok(Value::String(String::new()));
        }

        let caps = ENC_RE
            .captures(ciphertext)
            .ok_or_else(|| Error::BadFormat(ciphertext.to_string()))?;
        let data = BASE64.decode(&caps[1])?;
        let iv = BASE64.decode(&caps[2])?;
        let tag = BASE64.decode(&caps[3])?;
        let type_name = caps[4].to_string();

        if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
            return Err(Error::BadFormat(ciphertext.to_string()));
        }

        let mut sealed = data;
        sealed.extend_from_slice(&tag);

        let aead = aead_for(key)?;
        let plaintext = aead
            .decrypt(
                Nonce32::from_slice(&iv),
                Payload {
                    msg: &sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| Error::AeadVerifyFailed)?;

        let mut stashed_iv = [0u8; IV_SIZE];
        stashed_iv.copy_from_slice(&iv);
        self.stash
            .insert((plaintext.clone(), aad.to_string()), stashed_iv);

        reconstitute(&type_name, plaintext)
    }
}

fn aead_for(key: &[u8]) -> Result<Aes256Gcm32> {
    if key.len() != DATA_KEY_SIZE {
        return Err(Error::UnsupportedKeySize(key.len()));
    }
    Aes256Gcm32::new_from_slice(key).map_err(|_| Error::UnsupportedKeySize(key.len()))
}

fn type_tag(value: &Value) -> Result<&'static str> {
    match value {
        Value::String(_) => Ok("str"),
        // Timestamps travel as their RFC3339 text.
        Value::Timestamp(_) => Ok("str"),
        Value::Int(_) => Ok("int"),
        Value::Float(_) => Ok("float"),
        Value::Bool(_) => Ok("bool"),
        Value::Bytes(_) => Ok("bytes"),
        Value::Comment(_) => Ok("comment"),
        Value::Branch(_) => Err(Error::UnsupportedType("branch")),
        Value::Sequence(_) => Err(Error::UnsupportedType("sequence")),
        Value::Null => Err(Error::UnsupportedType("null")),
    }
}

fn reconstitute(type_name: &str, plaintext: Vec<u8>) -> Result<Value> {
    let as_text = || {
        String::from_utf8(plaintext.clone())
            .map_err(|_| Error::BadFormat(format!("{type_name} payload is not UTF-8")))
    };
    match type_name {
        "str" => Ok(Value::String(as_text()?)),
        "int" => {
            let text = as_text()?;
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::BadFormat(text))
        }
        "float" => {
            let text = as_text()?;
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Error::BadFormat(text))
        }
        "bool" => match as_text()?.as_str() {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            other => Err(Error::BadFormat(other.to_string())),
        },
        "bytes" => Ok(Value::Bytes(plaintext)),
        "comment" => Ok(Value::Comment(as_text()?)),
        other => Err(Error::UnknownType(other.to_string())),
    }
}

/// Parses an RFC3339 string back into a timestamp value. Used by
/// stores that materialize timestamps from plain scalars.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<chrono::FixedOffset>> {
    DateTime::parse_from_rfc3339(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [0x42u8; 32]
    }

    #[test]
    fn round_trip_all_types() {
        let mut cipher = Cipher::new();
        let values = vec![
            Value::String("hello".into()),
            Value::Int(-7),
            Value::Float(2.5),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bytes(vec![0, 159, 146, 150]),
            Value::Comment("a remark".into()),
        ];
        for value in values {
            let ct = cipher.encrypt(&value, &key(), "a:b:").unwrap();
            assert!(is_encrypted(&ct), "{ct}");
            let back = cipher.decrypt(&ct, &key(), "a:b:").unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn timestamp_encrypts_as_string() {
        let mut cipher = Cipher::new();
        let ts = DateTime::parse_from_rfc3339("2006-01-02T15:04:05+07:00").unwrap();
        let ct = cipher.encrypt(&Value::Timestamp(ts), &key(), "t:").unwrap();
        assert!(ct.contains(",type:str]"));
        let back = cipher.decrypt(&ct, &key(), "t:").unwrap();
        assert_eq!(back, Value::String("2006-01-02T15:04:05+07:00".into()));
    }

    #[test]
    fn empty_values_have_no_wrapper() {
        let mut cipher = Cipher::new();
        assert_eq!(
            cipher
                .encrypt(&Value::String(String::new()), &key(), "p:")
                .unwrap(),
            ""
        );
        assert_eq!(
            cipher.encrypt(&Value::Bytes(Vec::new()), &key(), "p:").unwrap(),
            ""
        );
        assert_eq!(
            cipher.decrypt("", &key(), "p:").unwrap(),
            Value::String(String::new())
        );
    }

    #[test]
    fn wrong_aad_is_rejected() {
        let mut cipher = Cipher::new();
        let ct = cipher
            .encrypt(&Value::String("secret".into()), &key(), "right:")
            .unwrap();
        let err = cipher.decrypt(&ct, &key(), "wrong:").unwrap_err();
        assert!(matches!(err, Error::AeadVerifyFailed));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let mut cipher = Cipher::new();
        let ct = cipher
            .encrypt(&Value::String("secret".into()), &key(), "p:")
            .unwrap();
        let err = cipher.decrypt(&ct, &[1u8; 32], "p:").unwrap_err();
        assert!(matches!(err, Error::AeadVerifyFailed));
    }

    #[test]
    fn stash_reproduces_identical_ciphertext() {
        let mut cipher = Cipher::new();
        let ct = cipher
            .encrypt(&Value::String("stable".into()), &key(), "p:")
            .unwrap();
        let _ = cipher.decrypt(&ct, &key(), "p:").unwrap();
        let again = cipher
            .encrypt(&Value::String("stable".into()), &key(), "p:")
            .unwrap();
        assert_eq!(ct, again);

        // A different value draws a fresh IV.
        let other = cipher
            .encrypt(&Value::String("changed".into()), &key(), "p:")
            .unwrap();
        assert_ne!(ct, other);
    }

    #[test]
    fn malformed_inputs_are_classified() {
        let mut cipher = Cipher::new();
        assert!(matches!(
            cipher.decrypt("not an enc value", &key(), "p:").unwrap_err(),
            Error::BadFormat(_)
        ));
        assert!(matches!(
            cipher
                .decrypt(
                    "ENC[AES256_GCM,data:!!!,iv:aaaa,tag:aaaa,type:str]",
                    &key(),
                    "p:"
                )
                .unwrap_err(),
            Error::BadBase64(_)
        ));
    }

    #[test]
    fn unknown_type_tag_is_reported() {
        let mut cipher = Cipher::new();
        let ct = cipher
            .encrypt(&Value::String("x".into()), &key(), "p:")
            .unwrap();
        let forged = ct.replace(",type:str]", ",type:uuid]");
        assert!(matches!(
            cipher.decrypt(&forged, &key(), "p:").unwrap_err(),
            Error::UnknownType(_)
        ));
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let mut cipher = Cipher::new();
        let err = cipher
            .encrypt(&Value::String("x".into()), &[0u8; 16], "p:")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeySize(16)));
    }
}
