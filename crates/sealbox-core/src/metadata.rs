//! The per-document metadata envelope.
//!
//! Two forms exist. The internal form carries strong types (key
//! groups, a compiled selection policy, parsed timestamps) and is what
//! the engine works with. The storage form is flat serde data in the
//! exact field layout written to disk, including the legacy
//! single-group encoding where master keys sit in per-variant lists at
//! the top level instead of under `key_groups`.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::cipher::DATA_KEY_SIZE;
use crate::error::{Error, KeyAttempt, Result};
use crate::keys::{
    AgeMasterKey, AzureKeyVaultMasterKey, GcpKmsMasterKey, KeyGroup, KmsMasterKey, MasterKey,
    PgpMasterKey, VaultTransitMasterKey,
};
use crate::keyservice::{KeyService, LocalKeyService};
use crate::policy::SelectionPolicy;
use crate::shamir::{self, Share};
use crate::timestamp;

/// The per-document symmetric key. Lives only in memory and is erased
/// on drop; it is never serialized, only wrapped blobs are.
pub struct DataKey([u8; DATA_KEY_SIZE]);

impl DataKey {
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; DATA_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| Error::Rng(e.to_string()))?;
        Ok(DataKey(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn from_bytes(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != DATA_KEY_SIZE {
            bytes.zeroize();
            return Err(Error::UnsupportedKeySize(bytes.len()));
        }
        let mut key = [0u8; DATA_KEY_SIZE];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(DataKey(key))
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "DataKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub key_groups: Vec<KeyGroup>,
    /// 0 disables secret sharing: any single master key recovers the
    /// data key. t >= 1 requires t group shares.
    pub shamir_threshold: usize,
    pub policy: SelectionPolicy,
    pub mac_only_encrypted: bool,
    pub last_modified: DateTime<Utc>,
    /// The document MAC as an ENC string, or empty before encryption.
    pub mac: String,
    pub version: String,
}

impl Metadata {
    pub fn new(key_groups: Vec<KeyGroup>, shamir_threshold: usize, policy: SelectionPolicy) -> Self {
        Metadata {
            key_groups,
            shamir_threshold,
            policy,
            mac_only_encrypted: false,
            last_modified: Utc::now(),
            mac: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn last_modified_rfc3339(&self) -> String {
        timestamp::to_rfc3339(&self.last_modified)
    }

    fn master_key_count(&self) -> usize {
        self.key_groups.iter().map(|g| g.0.len()).sum()
    }

    /// Generates a fresh data key and wraps it for every master key.
    pub async fn generate_data_key(&mut self, cancel: &CancellationToken) -> Result<DataKey> {
        let data_key = DataKey::generate()?;
        self.update_master_keys(&data_key, cancel).await?;
        Ok(data_key)
    }

    pub async fn update_master_keys(
        &mut self,
        data_key: &DataKey,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.update_master_keys_with(data_key, &LocalKeyService, cancel)
            .await
    }

    /// Wraps the data key under every master key that does not already
    /// hold a blob. Under a quorum threshold each group wraps its own
    /// Shamir share instead of the key itself; group *i* holds the
    /// share at x = i + 1.
    pub async fn update_master_keys_with(
        &mut self,
        data_key: &DataKey,
        service: &dyn KeyService,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.master_key_count() == 0 {
            return Err(Error::NoKeysConfigured);
        }

        let group_count = self.key_groups.len();
        let mut parts: Vec<Vec<u8>> = if self.shamir_threshold == 0 {
            vec![data_key.as_bytes().to_vec(); group_count]
        } else {
            if self.shamir_threshold > group_count {
                return Err(Error::MalformedMetadata(format!(
                    "quorum threshold {} exceeds the {} key groups",
                    self.shamir_threshold, group_count
                )));
            }
            shamir::split(data_key.as_bytes(), group_count, self.shamir_threshold)?
                .into_iter()
                .map(|share| share.data.clone())
                .collect()
        };

        let mut attempts = Vec::new();
        for (group, part) in self.key_groups.iter_mut().zip(parts.iter()) {
            let wraps = group.0.iter_mut().map(|key| {
                let variant = key.variant();
                let identifier = key.identifier();
                async move { (variant, identifier, service.wrap(key, part).await) }
            });
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                results = join_all(wraps) => results,
            };
            for (variant, identifier, result) in results {
                if let Err(e) = result {
                    attempts.push(KeyAttempt {
                        variant,
                        identifier,
                        error: e.to_string(),
                    });
                }
            }
        }
        for part in parts.iter_mut() {
            part.zeroize();
        }

        if attempts.is_empty() {
            Ok(())
        } else {
            Err(Error::KeyWrap { attempts })
        }
    }

    pub async fn data_key(&self, cancel: &CancellationToken) -> Result<DataKey> {
        self.data_key_with(&LocalKeyService, cancel).await
    }

    /// Recovers the data key, honoring the group quorum. Master keys
    /// are tried in document order; the first success in a group
    /// settles that group.
    pub async fn data_key_with(
        &self,
        service: &dyn KeyService,
        cancel: &CancellationToken,
    ) -> Result<DataKey> {
        if self.master_key_count() == 0 {
            return Err(Error::NoKeysConfigured);
        }

        let mut attempts = Vec::new();
        if self.shamir_threshold == 0 {
            for group in &self.key_groups {
                if let Some(bytes) = try_group(group, service, cancel, &mut attempts).await? {
                    return DataKey::from_bytes(bytes);
                }
            }
            return Err(Error::KeyRecovery { attempts });
        }

        let needed = self.shamir_threshold;
        let mut shares: Vec<Share> = Vec::with_capacity(needed);
        for (index, group) in self.key_groups.iter().enumerate() {
            if shares.len() == needed {
                break;
            }
            if let Some(bytes) = try_group(group, service, cancel, &mut attempts).await? {
                shares.push(Share {
                    x: index as u8 + 1,
                    data: bytes,
                });
            }
        }
        if shares.len() < needed {
            warn!(
                needed,
                got = shares.len(),
                "quorum not met while recovering the data key"
            );
            return Err(Error::InsufficientShares {
                needed,
                got: shares.len(),
                attempts,
            });
        }
        DataKey::from_bytes(shamir::combine(&shares)?)
    }
}

/// Tries every master key of one group in order. `Ok(None)` means the
/// whole group failed; its errors have been appended to `attempts`.
async fn try_group(
    group: &KeyGroup,
    service: &dyn KeyService,
    cancel: &CancellationToken,
    attempts: &mut Vec<KeyAttempt>,
) -> Result<Option<Vec<u8>>> {
    for key in &group.0 {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = service.unwrap(key) => result,
        };
        match result {
            Ok(bytes) => {
                debug!(variant = key.variant(), identifier = %key.identifier(), "unwrapped data key");
                return Ok(Some(bytes));
            }
            Err(e) => {
                debug!(variant = key.variant(), identifier = %key.identifier(), error = %e, "master key failed");
                attempts.push(KeyAttempt {
                    variant: key.variant(),
                    identifier: key.identifier(),
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Storage form
// ---------------------------------------------------------------------------

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Metadata exactly as serialized into documents, under the `sops`
/// top-level key. Empty variant lists are omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shamir_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_groups: Option<Vec<StoredKeyGroup>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<Vec<KmsMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_kms: Option<Vec<GcpKmsMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_kv: Option<Vec<AzureKeyVaultMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hc_vault: Option<Vec<VaultTransitMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<Vec<AgeMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp: Option<Vec<PgpMasterKey>>,
    pub lastmodified: String,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_regex: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mac_only_encrypted: bool,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredKeyGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<Vec<KmsMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_kms: Option<Vec<GcpKmsMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_kv: Option<Vec<AzureKeyVaultMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hc_vault: Option<Vec<VaultTransitMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<Vec<AgeMasterKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp: Option<Vec<PgpMasterKey>>,
}

impl StoredKeyGroup {
    fn from_group(group: &KeyGroup) -> StoredKeyGroup {
        let mut stored = StoredKeyGroup::default();
        for key in &group.0 {
            match key {
                MasterKey::Kms(k) => stored.kms.get_or_insert_with(Vec::new).push(k.clone()),
                MasterKey::GcpKms(k) => {
                    stored.gcp_kms.get_or_insert_with(Vec::new).push(k.clone())
                }
                MasterKey::AzureKeyVault(k) => {
                    stored.azure_kv.get_or_insert_with(Vec::new).push(k.clone())
                }
                MasterKey::VaultTransit(k) => {
                    stored.hc_vault.get_or_insert_with(Vec::new).push(k.clone())
                }
                MasterKey::Age(k) => stored.age.get_or_insert_with(Vec::new).push(k.clone()),
                MasterKey::Pgp(k) => stored.pgp.get_or_insert_with(Vec::new).push(k.clone()),
            }
        }
        stored
    }

    fn into_group(self) -> KeyGroup {
        let mut keys = Vec::new();
        keys.extend(self.kms.unwrap_or_default().into_iter().map(MasterKey::Kms));
        keys.extend(
            self.gcp_kms
                .unwrap_or_default()
                .into_iter()
                .map(MasterKey::GcpKms),
        );
        keys.extend(
            self.azure_kv
                .unwrap_or_default()
                .into_iter()
                .map(MasterKey::AzureKeyVault),
        );
        keys.extend(
            self.hc_vault
                .unwrap_or_default()
                .into_iter()
                .map(MasterKey::VaultTransit),
        );
        keys.extend(self.age.unwrap_or_default().into_iter().map(MasterKey::Age));
        keys.extend(self.pgp.unwrap_or_default().into_iter().map(MasterKey::Pgp));
        KeyGroup(keys)
    }

    fn is_empty(&self) -> bool {
        self.kms.is_none()
            && self.gcp_kms.is_none()
            && self.azure_kv.is_none()
            && self.hc_vault.is_none()
            && self.age.is_none()
            && self.pgp.is_none()
    }
}

impl From<&Metadata> for StoredMetadata {
    fn from(metadata: &Metadata) -> StoredMetadata {
        let mut stored = StoredMetadata {
            shamir_threshold: (metadata.shamir_threshold > 0).then_some(metadata.shamir_threshold),
            lastmodified: metadata.last_modified_rfc3339(),
            mac: metadata.mac.clone(),
            mac_only_encrypted: metadata.mac_only_encrypted,
            version: metadata.version.clone(),
            ..StoredMetadata::default()
        };

        match &metadata.policy {
            SelectionPolicy::UnencryptedSuffix(s) => stored.unencrypted_suffix = Some(s.clone()),
            SelectionPolicy::EncryptedSuffix(s) => stored.encrypted_suffix = Some(s.clone()),
            SelectionPolicy::UnencryptedRegex(re) => {
                stored.unencrypted_regex = Some(re.as_str().to_string())
            }
            SelectionPolicy::EncryptedRegex(re) => {
                stored.encrypted_regex = Some(re.as_str().to_string())
            }
        }

        // A single group is written in the legacy flat form; several
        // groups go under key_groups.
        match metadata.key_groups.as_slice() {
            [] => {}
            [single] => {
                let flat = StoredKeyGroup::from_group(single);
                stored.kms = flat.kms;
                stored.gcp_kms = flat.gcp_kms;
                stored.azure_kv = flat.azure_kv;
                stored.hc_vault = flat.hc_vault;
                stored.age = flat.age;
                stored.pgp = flat.pgp;
            }
            groups => {
                stored.key_groups = Some(groups.iter().map(StoredKeyGroup::from_group).collect());
            }
        }
        stored
    }
}

impl TryFrom<StoredMetadata> for Metadata {
    type Error = Error;

    fn try_from(stored: StoredMetadata) -> Result<Metadata> {
        let policy = {
            let mut rules: Vec<SelectionPolicy> = Vec::new();
            if let Some(s) = stored.unencrypted_suffix {
                rules.push(SelectionPolicy::UnencryptedSuffix(s));
            }
            if let Some(s) = stored.encrypted_suffix {
                rules.push(SelectionPolicy::EncryptedSuffix(s));
            }
            if let Some(p) = stored.unencrypted_regex {
                rules.push(SelectionPolicy::unencrypted_regex(&p)?);
            }
            if let Some(p) = stored.encrypted_regex {
                rules.push(SelectionPolicy::encrypted_regex(&p)?);
            }
            if rules.len() > 1 {
                return Err(Error::PolicyConflict);
            }
            rules.pop().unwrap_or_default()
        };

        let key_groups = match stored.key_groups {
            Some(groups) => groups.into_iter().map(StoredKeyGroup::into_group).collect(),
            None => {
                let flat = StoredKeyGroup {
                    kms: stored.kms,
                    gcp_kms: stored.gcp_kms,
                    azure_kv: stored.azure_kv,
                    hc_vault: stored.hc_vault,
                    age: stored.age,
                    pgp: stored.pgp,
                };
                if flat.is_empty() {
                    Vec::new()
                } else {
                    vec![flat.into_group()]
                }
            }
        };

        let last_modified = DateTime::parse_from_rfc3339(&stored.lastmodified)
            .map_err(|e| Error::MalformedMetadata(format!("lastmodified: {e}")))?
            .with_timezone(&Utc);

        Ok(Metadata {
            key_groups,
            shamir_threshold: stored.shamir_threshold.unwrap_or(0),
            policy,
            mac_only_encrypted: stored.mac_only_encrypted,
            last_modified,
            mac: stored.mac,
            version: stored.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_support;

    fn sample_metadata(groups: usize) -> Metadata {
        let key_groups = (0..groups)
            .map(|_| KeyGroup(vec![test_support::offline_age_key()]))
            .collect();
        Metadata::new(key_groups, 0, SelectionPolicy::default())
    }

    #[test]
    fn single_group_round_trips_through_flat_form() {
        let metadata = sample_metadata(1);
        let stored = StoredMetadata::from(&metadata);
        assert!(stored.key_groups.is_none());
        assert!(stored.age.is_some());
        assert_eq!(stored.unencrypted_suffix.as_deref(), Some("_unencrypted"));

        let back = Metadata::try_from(stored).unwrap();
        assert_eq!(back.key_groups.len(), 1);
        assert_eq!(back.policy, metadata.policy);
        assert_eq!(back.shamir_threshold, 0);
    }

    #[test]
    fn multiple_groups_use_key_groups_form() {
        let mut metadata = sample_metadata(3);
        metadata.shamir_threshold = 2;
        let stored = StoredMetadata::from(&metadata);
        assert!(stored.age.is_none());
        assert_eq!(stored.key_groups.as_ref().map(Vec::len), Some(3));
        assert_eq!(stored.shamir_threshold, Some(2));

        let back = Metadata::try_from(stored).unwrap();
        assert_eq!(back.key_groups.len(), 3);
        assert_eq!(back.shamir_threshold, 2);
    }

    #[test]
    fn conflicting_policies_are_rejected() {
        let metadata = sample_metadata(1);
        let mut stored = StoredMetadata::from(&metadata);
        stored.encrypted_suffix = Some("_secret".into());
        assert!(matches!(
            Metadata::try_from(stored),
            Err(Error::PolicyConflict)
        ));
    }

    #[test]
    fn malformed_lastmodified_is_rejected() {
        let metadata = sample_metadata(1);
        let mut stored = StoredMetadata::from(&metadata);
        stored.lastmodified = "yesterday".into();
        assert!(matches!(
            Metadata::try_from(stored),
            Err(Error::MalformedMetadata(_))
        ));
    }

    #[tokio::test]
    async fn wrap_and_recover_without_quorum() {
        test_support::install_offline_age_identity();
        let mut metadata = sample_metadata(1);
        let cancel = CancellationToken::new();
        let data_key = metadata.generate_data_key(&cancel).await.unwrap();
        assert!(metadata.key_groups[0].0[0].encrypted_data_key().is_some());

        let recovered = metadata.data_key(&cancel).await.unwrap();
        assert_eq!(recovered.as_bytes(), data_key.as_bytes());
    }

    #[tokio::test]
    async fn cancelled_recovery_returns_promptly() {
        let mut metadata = sample_metadata(1);
        let cancel = CancellationToken::new();
        test_support::install_offline_age_identity();
        let _ = metadata.generate_data_key(&cancel).await.unwrap();

        cancel.cancel();
        assert!(matches!(
            metadata.data_key(&cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn empty_metadata_has_no_keys() {
        let metadata = Metadata::new(Vec::new(), 0, SelectionPolicy::default());
        let cancel = CancellationToken::new();
        assert!(matches!(
            metadata.data_key(&cancel).await,
            Err(Error::NoKeysConfigured)
        ));
    }
}
