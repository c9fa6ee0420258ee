//! Re-derives the value-encryption format from primitives, without
//! linking sealbox-core, and checks a published KAT file against it.

use aead::consts::U32;
use aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

type Aes256Gcm32 = AesGcm<Aes256, U32>;

#[derive(Deserialize)]
struct Kat {
    version: String,
    key_hex: String,
    aad: String,
    enc: String,
    plaintext_utf8: String,
    #[serde(rename = "type")]
    type_tag: String,
}

struct EncParts {
    data: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
    type_tag: String,
}

fn parse_enc(enc: &str) -> anyhow::Result<EncParts> {
    let body = enc
        .strip_prefix("ENC[AES256_GCM,")
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| anyhow::anyhow!("not an ENC value: {enc}"))?;
    let mut data = None;
    let mut iv = None;
    let mut tag = None;
    let mut type_tag = None;
    for field in body.split(',') {
        let (name, value) = field
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed field {field:?}"))?;
        match name {
            "data" => data = Some(BASE64.decode(value)?),
            "iv" => iv = Some(BASE64.decode(value)?),
            "tag" => tag = Some(BASE64.decode(value)?),
            "type" => type_tag = Some(value.to_string()),
            other => anyhow::bail!("unknown field {other:?}"),
        }
    }
    Ok(EncParts {
        data: data.ok_or_else(|| anyhow::anyhow!("missing data"))?,
        iv: iv.ok_or_else(|| anyhow::anyhow!("missing iv"))?,
        tag: tag.ok_or_else(|| anyhow::anyhow!("missing tag"))?,
        type_tag: type_tag.ok_or_else(|| anyhow::anyhow!("missing type"))?,
    })
}

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).expect("usage: verify-kat file.json");
    let data = std::fs::read_to_string(path)?;
    let kat: Kat = serde_json::from_str(&data)?;
    println!("KAT version {}", kat.version);

    let key = hex::decode(&kat.key_hex)?;
    anyhow::ensure!(key.len() == 32, "key must be 32 bytes");

    let parts = parse_enc(&kat.enc)?;
    anyhow::ensure!(parts.iv.len() == 32, "iv must decode to 32 bytes");
    anyhow::ensure!(parts.tag.len() == 16, "tag must decode to 16 bytes");
    anyhow::ensure!(parts.type_tag == kat.type_tag, "type tag mismatch");

    let mut sealed = parts.data.clone();
    sealed.extend_from_slice(&parts.tag);

    let aead = Aes256Gcm32::new_from_slice(&key).expect("checked length");
    let nonce = aes_gcm::Nonce::<U32>::from_slice(&parts.iv);
    let plaintext = aead
        .decrypt(
            nonce,
            Payload {
                msg: &sealed,
                aad: kat.aad.as_bytes(),
            },
        )
        .map_err(|_| anyhow::anyhow!("authentication failed"))?;
    anyhow::ensure!(
        plaintext == kat.plaintext_utf8.as_bytes(),
        "plaintext mismatch"
    );

    // Wrong AAD must fail.
    let flipped = format!("{}x", kat.aad);
    anyhow::ensure!(
        aead.decrypt(
            nonce,
            Payload {
                msg: &sealed,
                aad: flipped.as_bytes(),
            },
        )
        .is_err(),
        "tampered AAD was accepted"
    );

    println!("KAT OK");
    Ok(())
}
