//! age X25519 recipients.
//!
//! The data key is wrapped as a single-stanza age v1 file and stored
//! ASCII-armored in the `enc` field. Unwrapping loads X25519 identities
//! from the environment (`SEALBOX_AGE_KEY`, `SEALBOX_AGE_KEY_FILE`) or
//! the default key file and tries each against the stanza.
//!
//! File layout, per age-encryption.org/v1:
//!
//! ```text
//! age-encryption.org/v1
//! -> X25519 <b64(ephemeral pk)>
//! <b64(ChaCha20-Poly1305(wrap key, zero nonce, file key))>
//! --- <b64(header HMAC)>
//! <16-byte payload nonce><STREAM ciphertext of the body>
//! ```

use base64::engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD};
use base64::Engine as _;
use bech32::{FromBase32, ToBase32, Variant};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{Error, Result};

const VERSION_LINE: &str = "age-encryption.org/v1";
const X25519_INFO: &[u8] = b"age-encryption.org/v1/X25519";
const RECIPIENT_HRP: &str = "age";
const IDENTITY_HRP: &str = "age-secret-key-";
const ARMOR_BEGIN: &str = "-----BEGIN AGE ENCRYPTED FILE-----";
const ARMOR_END: &str = "-----END AGE ENCRYPTED FILE-----";
const FILE_KEY_LEN: usize = 16;

pub const KEY_ENV: &str = "SEALBOX_AGE_KEY";
pub const KEY_FILE_ENV: &str = "SEALBOX_AGE_KEY_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeMasterKey {
    pub recipient: String,
    #[serde(default)]
    pub enc: String,
    #[serde(default = "unix_epoch", with = "crate::timestamp::rfc3339")]
    pub created_at: DateTime<Utc>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl AgeMasterKey {
    pub fn new(recipient: &str) -> Result<Self> {
        decode_recipient(recipient)?;
        Ok(AgeMasterKey {
            recipient: recipient.to_string(),
            enc: String::new(),
            created_at: Utc::now(),
        })
    }

    /// Generates a fresh X25519 identity, returning the
    /// `AGE-SECRET-KEY-1...` string and its `age1...` recipient.
    pub fn generate_identity() -> (String, String) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (
            encode_identity(&secret.to_bytes()),
            encode_recipient(public.as_bytes()),
        )
    }

    /// Derives the recipient string of an existing identity.
    pub fn recipient_from_identity(identity: &str) -> Result<String> {
        let secret = decode_identity(identity).ok_or_else(|| {
            Error::MalformedMetadata("not an AGE-SECRET-KEY-1 identity".into())
        })?;
        let public = PublicKey::from(&StaticSecret::from(secret));
        Ok(encode_recipient(public.as_bytes()))
    }

    pub fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        let recipient_pk = decode_recipient(&self.recipient)?;
        let file = seal(&recipient_pk, data_key)
            .map_err(|e| Error::master_key("age", &self.recipient, e))?;
        self.enc = armor(&file);
        Ok(())
    }

    pub fn decrypt(&self) -> Result<Vec<u8>> {
        if self.enc.is_empty() {
            return Err(Error::master_key(
                "age",
                &self.recipient,
                "no wrapped data key present",
            ));
        }
        let identities = load_identities()
            .map_err(|e| Error::master_key("age", &self.recipient, e))?;
        let file = unarmor(&self.enc)
            .map_err(|e| Error::master_key("age", &self.recipient, e))?;
        open(&file, &identities).map_err(|e| Error::master_key("age", &self.recipient, e))
    }
}

pub(crate) fn encode_recipient(pk: &[u8; 32]) -> String {
    bech32::encode(RECIPIENT_HRP, pk.to_base32(), Variant::Bech32)
        .expect("bech32 hrp is valid")
}

pub(crate) fn encode_identity(sk: &[u8; 32]) -> String {
    bech32::encode(IDENTITY_HRP, sk.to_base32(), Variant::Bech32)
        .expect("bech32 hrp is valid")
        .to_uppercase()
}

fn decode_recipient(recipient: &str) -> Result<[u8; 32]> {
    decode_bech32(recipient, RECIPIENT_HRP)
        .ok_or_else(|| Error::MalformedMetadata(format!("invalid age recipient {recipient:?}")))
}

fn decode_identity(identity: &str) -> Option<[u8; 32]> {
    decode_bech32(identity, IDENTITY_HRP)
}

fn decode_bech32(encoded: &str, expected_hrp: &str) -> Option<[u8; 32]> {
    let (hrp, data, variant) = bech32::decode(encoded.trim()).ok()?;
    if hrp != expected_hrp || variant != Variant::Bech32 {
        return None;
    }
    let bytes = Vec::<u8>::from_base32(&data).ok()?;
    bytes.try_into().ok()
}

fn hkdf32(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).expect("okm length is valid");
    okm
}

fn wrap_key_for(ephemeral_pk: &PublicKey, recipient_pk: &PublicKey, shared: &[u8]) -> [u8; 32] {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_pk.as_bytes());
    salt.extend_from_slice(recipient_pk.as_bytes());
    hkdf32(&salt, shared, X25519_INFO)
}

fn seal(recipient_pk_bytes: &[u8; 32], body: &[u8]) -> Result<Vec<u8>, String> {
    let mut file_key = [0u8; FILE_KEY_LEN];
    OsRng
        .try_fill_bytes(&mut file_key)
        .map_err(|e| e.to_string())?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pk = PublicKey::from(&ephemeral);
    let recipient_pk = PublicKey::from(*recipient_pk_bytes);
    let shared = ephemeral.diffie_hellman(&recipient_pk);
    if !shared.was_contributory() {
        return Err("low-order recipient point".into());
    }

    let wrap_key = wrap_key_for(&ephemeral_pk, &recipient_pk, shared.as_bytes());
    let sealed_file_key = ChaCha20Poly1305::new(ChaChaKey::from_slice(&wrap_key))
        .encrypt(ChaChaNonce::from_slice(&[0u8; 12]), &file_key[..])
        .map_err(|_| "file key seal failed".to_string())?;

    let mut header = format!(
        "{VERSION_LINE}\n-> X25519 {}\n",
        BASE64_NO_PAD.encode(ephemeral_pk.as_bytes())
    );
    for line in wrap_lines(&BASE64_NO_PAD.encode(&sealed_file_key)) {
        header.push_str(&line);
        header.push('\n');
    }
    header.push_str("---");

    let mac_key = hkdf32(&[], &file_key, b"header");
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&mac_key).expect("any key length is valid");
    mac.update(header.as_bytes());
    let header_mac = mac.finalize().into_bytes();
    header.push(' ');
    header.push_str(&BASE64_NO_PAD.encode(header_mac));
    header.push('\n');

    let mut payload_nonce = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut payload_nonce)
        .map_err(|e| e.to_string())?;
    let payload_key = hkdf32(&payload_nonce, &file_key, b"payload");
    let ciphertext = ChaCha20Poly1305::new(ChaChaKey::from_slice(&payload_key))
        .encrypt(ChaChaNonce::from_slice(&final_chunk_nonce()), body)
        .map_err(|_| "payload seal failed".to_string())?;
    file_key.zeroize();

    let mut out = header.into_bytes();
    out.extend_from_slice(&payload_nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(file: &[u8], identities: &[StaticSecret]) -> Result<Vec<u8>, String> {
    let (header_for_mac, stored_mac, payload) = split_file(file)?;
    let header_text =
        std::str::from_utf8(header_for_mac).map_err(|_| "header is not UTF-8".to_string())?;

    let mut lines = header_text.lines();
    if lines.next() != Some(VERSION_LINE) {
        return Err("unsupported age version".into());
    }

    let mut file_key: Option<[u8; FILE_KEY_LEN]> = None;
    let mut pending: Option<(PublicKey, String)> = None;
    for line in lines {
        if let Some(rest) = line.strip_prefix("-> ") {
            try_open_stanza(&mut file_key, pending.take(), identities);
            let mut parts = rest.split(' ');
            let kind = parts.next().unwrap_or_default();
            let arg = parts.next().unwrap_or_default();
            if kind == "X25519" {
                let pk_bytes: [u8; 32] = BASE64_NO_PAD
                    .decode(arg)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or("malformed X25519 stanza argument")?;
                pending = Some((PublicKey::from(pk_bytes), String::new()));
            }
        } else if line == "---" {
            break;
        } else if let Some((_, body)) = pending.as_mut() {
            body.push_str(line);
        }
    }
    try_open_stanza(&mut file_key, pending.take(), identities);

    let mut file_key = file_key.ok_or("no identity matched any recipient stanza")?;

    // The header MAC proves the stanza list was not tampered with.
    let stored_mac = BASE64_NO_PAD
        .decode(stored_mac)
        .map_err(|_| "bad MAC base64".to_string())?;
    let mac_key = hkdf32(&[], &file_key, b"header");
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&mac_key).expect("any key length is valid");
    mac.update(header_for_mac);
    mac.verify_slice(&stored_mac)
        .map_err(|_| "header MAC mismatch".to_string())?;

    if payload.len() < 16 {
        return Err("truncated payload".into());
    }
    let (payload_nonce, body) = payload.split_at(16);
    let payload_key = hkdf32(payload_nonce, &file_key, b"payload");
    file_key.zeroize();
    ChaCha20Poly1305::new(ChaChaKey::from_slice(&payload_key))
        .decrypt(ChaChaNonce::from_slice(&final_chunk_nonce()), body)
        .map_err(|_| "payload authentication failed".to_string())
}

/// Attempts to unwrap one parsed stanza with every identity.
fn try_open_stanza(
    file_key: &mut Option<[u8; FILE_KEY_LEN]>,
    stanza: Option<(PublicKey, String)>,
    identities: &[StaticSecret],
) {
    let (ephemeral_pk, body_b64) = match stanza {
        Some(s) if file_key.is_none() => s,
        _ => return,
    };
    let sealed = match BASE64_NO_PAD.decode(body_b64.as_str()) {
        Ok(b) => b,
        Err(_) => return,
    };
    for identity in identities {
        let recipient_pk = PublicKey::from(identity);
        let shared = identity.diffie_hellman(&ephemeral_pk);
        if !shared.was_contributory() {
            continue;
        }
        let wrap_key = wrap_key_for(&ephemeral_pk, &recipient_pk, shared.as_bytes());
        if let Ok(unwrapped) = ChaCha20Poly1305::new(ChaChaKey::from_slice(&wrap_key))
            .decrypt(ChaChaNonce::from_slice(&[0u8; 12]), sealed.as_slice())
        {
            if let Ok(key) = <[u8; FILE_KEY_LEN]>::try_from(unwrapped.as_slice()) {
                *file_key = Some(key);
                return;
            }
        }
    }
}

/// Splits the raw file into (header bytes through `---`, base64 MAC,
/// payload bytes).
fn split_file(file: &[u8]) -> Result<(&[u8], &str, &[u8]), String> {
    let marker = b"\n--- ";
    let pos = file
        .windows(marker.len())
        .position(|w| w == marker)
        .ok_or("missing header terminator")?;
    let header_for_mac = &file[..pos + 4]; // through "---", excluding the space
    let mac_start = pos + marker.len();
    let newline = file[mac_start..]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or("missing payload")?;
    let mac_b64 =
        std::str::from_utf8(&file[mac_start..mac_start + newline]).map_err(|_| "bad MAC encoding")?;
    let payload = &file[mac_start + newline + 1..];
    Ok((header_for_mac, mac_b64, payload))
}

/// STREAM nonce of the first and only chunk: 11-byte counter at zero,
/// final-chunk flag set.
fn final_chunk_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[11] = 1;
    nonce
}

fn wrap_lines(encoded: &str) -> Vec<String> {
    encoded
        .as_bytes()
        .chunks(64)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

fn armor(file: &[u8]) -> String {
    let mut out = String::from(ARMOR_BEGIN);
    out.push('\n');
    for line in wrap_lines(&BASE64.encode(file)) {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(ARMOR_END);
    out
}

fn unarmor(armored: &str) -> Result<Vec<u8>, String> {
    let mut collected = String::new();
    let mut inside = false;
    for line in armored.lines() {
        let line = line.trim();
        match line {
            ARMOR_BEGIN => inside = true,
            ARMOR_END => break,
            _ if inside => collected.push_str(line),
            _ => {}
        }
    }
    if collected.is_empty() {
        return Err("no armored payload found".into());
    }
    BASE64
        .decode(collected)
        .map_err(|e| format!("bad armor base64: {e}"))
}

/// Collects X25519 identities from the environment and the default key
/// file, in that order.
fn load_identities() -> Result<Vec<StaticSecret>, String> {
    let mut sources = Vec::new();
    if let Ok(inline) = std::env::var(KEY_ENV) {
        sources.push(inline);
    }
    if let Ok(path) = std::env::var(KEY_FILE_ENV) {
        sources.push(std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?);
    }
    if let Some(default_path) = default_key_file() {
        if let Ok(content) = std::fs::read_to_string(&default_path) {
            sources.push(content);
        }
    }

    let mut identities = Vec::new();
    for source in sources {
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(sk) = decode_identity(line) {
                identities.push(StaticSecret::from(sk));
            }
        }
    }
    if identities.is_empty() {
        return Err(format!(
            "no age identity found; set {KEY_ENV} or {KEY_FILE_ENV}"
        ));
    }
    Ok(identities)
}

fn default_key_file() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("sealbox").join("age").join("keys.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (StaticSecret, [u8; 32]) {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        (sk, *pk.as_bytes())
    }

    #[test]
    fn seal_and_open_round_trip() {
        let (sk, pk) = keypair();
        let data_key = [0xabu8; 32];
        let file = seal(&pk, &data_key).unwrap();
        let opened = open(&file, &[sk]).unwrap();
        assert_eq!(opened, data_key);
    }

    #[test]
    fn wrong_identity_cannot_open() {
        let (_, pk) = keypair();
        let (other_sk, _) = keypair();
        let file = seal(&pk, &[1u8; 32]).unwrap();
        assert!(open(&file, &[other_sk]).is_err());
    }

    #[test]
    fn tampered_header_fails_mac() {
        let (sk, pk) = keypair();
        let file = seal(&pk, &[2u8; 32]).unwrap();
        // Insert a well-formed forged stanza before the MAC line; the
        // first stanza still opens, so failure must come from the MAC.
        let forged_arg = "A".repeat(43);
        let text = String::from_utf8_lossy(&file).into_owned();
        let forged = text.replacen(
            "\n---",
            &format!("\n-> X25519 {forged_arg}\nAAAA\n---"),
            1,
        );
        let err = open(forged.as_bytes(), &[sk]).unwrap_err();
        assert!(err.contains("MAC"), "{err}");
    }

    #[test]
    fn armor_round_trips() {
        let data = (0u8..=255).collect::<Vec<_>>();
        let armored = armor(&data);
        assert!(armored.starts_with(ARMOR_BEGIN));
        assert_eq!(unarmor(&armored).unwrap(), data);
    }

    #[test]
    fn recipient_encoding_round_trips() {
        let (_, pk) = keypair();
        let recipient = encode_recipient(&pk);
        assert!(recipient.starts_with("age1"));
        assert_eq!(decode_recipient(&recipient).unwrap(), pk);
    }

    #[test]
    fn identity_encoding_round_trips() {
        let (sk, _) = keypair();
        let encoded = encode_identity(&sk.to_bytes());
        assert!(encoded.starts_with("AGE-SECRET-KEY-1"));
        assert_eq!(decode_identity(&encoded).unwrap(), sk.to_bytes());
    }

    #[test]
    fn master_key_wrap_unwrap_via_env() {
        // The same fixed identity the rest of the test suite installs,
        // so concurrent tests never fight over the variable.
        let sk = StaticSecret::from([7u8; 32]);
        let pk = *PublicKey::from(&sk).as_bytes();
        let mut key = AgeMasterKey::new(&encode_recipient(&pk)).unwrap();
        key.encrypt(&[9u8; 32]).unwrap();
        assert!(key.enc.starts_with(ARMOR_BEGIN));

        std::env::set_var(KEY_ENV, encode_identity(&sk.to_bytes()));
        let recovered = key.decrypt().unwrap();
        assert_eq!(recovered, vec![9u8; 32]);
    }
}
