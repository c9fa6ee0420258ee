//! Master-key custodians.
//!
//! A master key wraps the per-document data key and stores the opaque
//! wrapped blob in its own `enc` field; any custodian that can unwrap
//! its blob recovers the data key (or, under a quorum, its group's
//! share). Variants are a tagged union behind one capability set
//! rather than a trait object: the set of custodians is closed and the
//! metadata envelope needs to name each one.

mod age;
mod azure;
mod gcp;
mod kms;
mod pgp;
mod vault;

pub use age::AgeMasterKey;
pub use azure::AzureKeyVaultMasterKey;
pub use gcp::GcpKmsMasterKey;
pub use kms::KmsMasterKey;
pub use pgp::PgpMasterKey;
pub use vault::VaultTransitMasterKey;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};

/// Wrapped blobs older than this are due for rotation.
const ROTATION_TTL_DAYS: i64 = 180;

#[derive(Debug, Clone, PartialEq)]
pub enum MasterKey {
    Kms(KmsMasterKey),
    Pgp(PgpMasterKey),
    Age(AgeMasterKey),
    VaultTransit(VaultTransitMasterKey),
    AzureKeyVault(AzureKeyVaultMasterKey),
    GcpKms(GcpKmsMasterKey),
}

impl MasterKey {
    /// The storage-form list this variant serializes into.
    pub fn variant(&self) -> &'static str {
        match self {
            MasterKey::Kms(_) => "kms",
            MasterKey::Pgp(_) => "pgp",
            MasterKey::Age(_) => "age",
            MasterKey::VaultTransit(_) => "hc_vault",
            MasterKey::AzureKeyVault(_) => "azure_kv",
            MasterKey::GcpKms(_) => "gcp_kms",
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            MasterKey::Kms(k) => k.arn.clone(),
            MasterKey::Pgp(k) => k.fp.clone(),
            MasterKey::Age(k) => k.recipient.clone(),
            MasterKey::VaultTransit(k) => k.identifier(),
            MasterKey::AzureKeyVault(k) => k.identifier(),
            MasterKey::GcpKms(k) => k.resource_id.clone(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            MasterKey::Kms(k) => k.created_at,
            MasterKey::Pgp(k) => k.created_at,
            MasterKey::Age(k) => k.created_at,
            MasterKey::VaultTransit(k) => k.created_at,
            MasterKey::AzureKeyVault(k) => k.created_at,
            MasterKey::GcpKms(k) => k.created_at,
        }
    }

    /// The wrapped data key, when one has been stored.
    pub fn encrypted_data_key(&self) -> Option<&str> {
        let enc = match self {
            MasterKey::Kms(k) => &k.enc,
            MasterKey::Pgp(k) => &k.enc,
            MasterKey::Age(k) => &k.enc,
            MasterKey::VaultTransit(k) => &k.enc,
            MasterKey::AzureKeyVault(k) => &k.enc,
            MasterKey::GcpKms(k) => &k.enc,
        };
        (!enc.is_empty()).then_some(enc.as_str())
    }

    /// Wraps `data_key` with this custodian and stores the blob.
    pub async fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        match self {
            MasterKey::Kms(k) => k.encrypt(data_key).await,
            MasterKey::Pgp(k) => k.encrypt(data_key).await,
            MasterKey::Age(k) => k.encrypt(data_key),
            MasterKey::VaultTransit(k) => k.encrypt(data_key).await,
            MasterKey::AzureKeyVault(k) => k.encrypt(data_key).await,
            MasterKey::GcpKms(k) => k.encrypt(data_key).await,
        }
    }

    /// No-op when a wrapped blob is already present.
    pub async fn encrypt_if_needed(&mut self, data_key: &[u8]) -> Result<()> {
        if self.encrypted_data_key().is_some() {
            return Ok(());
        }
        self.encrypt(data_key).await
    }

    /// Unwraps and returns the data key (or group share).
    pub async fn decrypt(&self) -> Result<Vec<u8>> {
        match self {
            MasterKey::Kms(k) => k.decrypt().await,
            MasterKey::Pgp(k) => k.decrypt().await,
            MasterKey::Age(k) => k.decrypt(),
            MasterKey::VaultTransit(k) => k.decrypt().await,
            MasterKey::AzureKeyVault(k) => k.decrypt().await,
            MasterKey::GcpKms(k) => k.decrypt().await,
        }
    }

    /// Whether the wrapped blob is older than the rotation TTL.
    pub fn needs_rotation(&self) -> bool {
        Utc::now() - self.created_at() > Duration::days(ROTATION_TTL_DAYS)
    }

    /// Drops the stored blob so the next wrap produces a fresh one.
    /// Used by key rotation.
    pub fn clear_wrapped_data_key(&mut self) {
        match self {
            MasterKey::Kms(k) => k.enc.clear(),
            MasterKey::Pgp(k) => k.enc.clear(),
            MasterKey::Age(k) => k.enc.clear(),
            MasterKey::VaultTransit(k) => k.enc.clear(),
            MasterKey::AzureKeyVault(k) => k.enc.clear(),
            MasterKey::GcpKms(k) => k.enc.clear(),
        }
    }

    /// The flat storage form of this key, for stores that need to
    /// flatten metadata into scalar entries.
    pub fn to_map(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let value = match self {
            MasterKey::Kms(k) => serde_json::to_value(k),
            MasterKey::Pgp(k) => serde_json::to_value(k),
            MasterKey::Age(k) => serde_json::to_value(k),
            MasterKey::VaultTransit(k) => serde_json::to_value(k),
            MasterKey::AzureKeyVault(k) => serde_json::to_value(k),
            MasterKey::GcpKms(k) => serde_json::to_value(k),
        }
        .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(Error::MalformedMetadata("master key is not a map".into())),
        }
    }
}

/// An ordered list of master keys, any one of which can recover the
/// group's share of the data key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyGroup(pub Vec<MasterKey>);

impl KeyGroup {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Helpers for tests that need a custodian working entirely offline.
/// A fixed X25519 identity is installed into the age key environment
/// variable; setting the same value from concurrent tests is
/// harmless.
#[cfg(test)]
pub mod test_support {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];

    pub fn offline_age_key() -> MasterKey {
        let pk = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(SECRET));
        MasterKey::Age(AgeMasterKey::new(&age::encode_recipient(pk.as_bytes())).unwrap())
    }

    pub fn install_offline_age_identity() {
        std::env::set_var(age::KEY_ENV, age::encode_identity(&SECRET));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_recipient() -> String {
        age::encode_recipient(&[7u8; 32])
    }

    #[test]
    fn rotation_is_due_after_ttl() {
        let mut key = AgeMasterKey::new(&sample_recipient()).unwrap();
        key.created_at = Utc::now() - Duration::days(ROTATION_TTL_DAYS + 1);
        let key = MasterKey::Age(key);
        assert!(key.needs_rotation());
    }

    #[test]
    fn fresh_key_is_not_due() {
        let key = MasterKey::Age(AgeMasterKey::new(&sample_recipient()).unwrap());
        assert!(!key.needs_rotation());
        assert!(key.encrypted_data_key().is_none());
    }
}
