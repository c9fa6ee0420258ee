//! OpenPGP master keys.
//!
//! Wrapping encrypts the data key to the recipient identified by a
//! 40-hex fingerprint, producing an ASCII-armored message. The gpg
//! binary (with the local agent handling passphrases) is the default
//! backend; with the `pgp-embedded` feature an in-process rPGP backend
//! is tried first and the binary remains the fallback.

use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

pub const GPG_EXEC_ENV: &str = "SEALBOX_GPG_EXEC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgpMasterKey {
    pub fp: String,
    #[serde(with = "crate::timestamp::rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub enc: String,
}

impl PgpMasterKey {
    pub fn new(fingerprint: &str) -> Result<Self> {
        let fp: String = fingerprint
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        if fp.len() != 40 || !fp.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::MalformedMetadata(format!(
                "not a 40-hex OpenPGP fingerprint: {fingerprint:?}"
            )));
        }
        Ok(PgpMasterKey {
            fp,
            created_at: Utc::now(),
            enc: String::new(),
        })
    }

    pub async fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        #[cfg(feature = "pgp-embedded")]
        match embedded::encrypt(&self.fp, data_key) {
            Ok(armored) => {
                self.enc = armored;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(fp = %self.fp, error = %e, "embedded pgp encrypt failed, trying gpg binary");
            }
        }

        let armored = self
            .run_gpg(
                &[
                    "--no-tty",
                    "--batch",
                    "--yes",
                    "--encrypt",
                    "--armor",
                    "--trust-model",
                    "always",
                    "-r",
                    &self.fp,
                ],
                data_key,
            )
            .await?;
        self.enc = String::from_utf8(armored)
            .map_err(|_| Error::master_key("pgp", &self.fp, "gpg produced non-UTF-8 armor"))?
            .trim_end()
            .to_string();
        Ok(())
    }

    pub async fn decrypt(&self) -> Result<Vec<u8>> {
        if self.enc.is_empty() {
            return Err(Error::master_key(
                "pgp",
                &self.fp,
                "no wrapped data key present",
            ));
        }

        #[cfg(feature = "pgp-embedded")]
        match embedded::decrypt(&self.enc) {
            Ok(plaintext) => return Ok(plaintext),
            Err(e) => {
                tracing::debug!(fp = %self.fp, error = %e, "embedded pgp decrypt failed, trying gpg binary");
            }
        }

        self.run_gpg(&["--no-tty", "--batch", "--yes", "-d"], self.enc.as_bytes())
            .await
    }

    async fn run_gpg(&self, args: &[&str], stdin: &[u8]) -> Result<Vec<u8>> {
        let binary = std::env::var(GPG_EXEC_ENV).unwrap_or_else(|_| "gpg".to_string());
        let mut child = Command::new(&binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::master_key("pgp", &self.fp, format!("spawn {binary}: {e}")))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)
                .await
                .map_err(|e| Error::master_key("pgp", &self.fp, e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::master_key("pgp", &self.fp, e))?;
        if !output.status.success() {
            return Err(Error::master_key(
                "pgp",
                &self.fp,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(output.stdout)
    }
}

/// In-process OpenPGP via rPGP. Public certificates are looked up as
/// `<fingerprint>.asc` under the sealbox config directory; secret keys
/// come from `SEALBOX_PGP_SECRET_KEY_FILE`.
#[cfg(feature = "pgp-embedded")]
mod embedded {
    use pgp::composed::{Deserializable, Message, SignedPublicKey, SignedSecretKey};
    use pgp::crypto::sym::SymmetricKeyAlgorithm;
    use rand::rngs::OsRng;

    pub const SECRET_KEY_FILE_ENV: &str = "SEALBOX_PGP_SECRET_KEY_FILE";

    fn certificate_path(fp: &str) -> Result<std::path::PathBuf, String> {
        let dir = dirs::config_dir().ok_or("no config directory")?;
        Ok(dir.join("sealbox").join("pgp").join(format!("{fp}.asc")))
    }

    pub fn encrypt(fp: &str, data: &[u8]) -> Result<String, String> {
        let path = certificate_path(fp)?;
        let armored = std::fs::read_to_string(&path)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        let (certificate, _) =
            SignedPublicKey::from_string(&armored).map_err(|e| e.to_string())?;
        let message = Message::new_literal_bytes("", data);
        let encrypted = message
            .encrypt_to_keys(&mut OsRng, SymmetricKeyAlgorithm::AES256, &[&certificate])
            .map_err(|e| e.to_string())?;
        encrypted.to_armored_string(None).map_err(|e| e.to_string())
    }

    pub fn decrypt(armored: &str) -> Result<Vec<u8>, String> {
        let path = std::env::var(SECRET_KEY_FILE_ENV).map_err(|_| "no secret key file set")?;
        let key_text = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
        let (secret_key, _) = SignedSecretKey::from_string(&key_text).map_err(|e| e.to_string())?;
        let (message, _) = Message::from_string(armored).map_err(|e| e.to_string())?;
        let (decrypted, _) = message
            .decrypt(|| String::new(), &[&secret_key])
            .map_err(|e| e.to_string())?;
        decrypted
            .get_content()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "message had no literal content".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_normalized() {
        let key = PgpMasterKey::new("85d7 7543 b3d6 24b6 3466 aa53 9ffc 2d4c 1e8c c1b5").unwrap();
        assert_eq!(key.fp, "85D77543B3D624B63466AA539FFC2D4C1E8CC1B5");
    }

    #[test]
    fn short_or_non_hex_fingerprints_are_rejected() {
        assert!(PgpMasterKey::new("deadbeef").is_err());
        assert!(PgpMasterKey::new(&"g".repeat(40)).is_err());
    }
}
