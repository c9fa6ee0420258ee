//! AWS KMS master keys.
//!
//! The data key is wrapped with a remote `Encrypt` call against the key
//! named by the ARN; the region is taken from the ARN itself. An
//! optional assume-role, encryption context and shared-config profile
//! mirror what operators configure in practice.

use std::collections::{BTreeMap, HashMap};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static ARN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^arn:aws[\w-]*:kms:(.+):[0-9]+:(key|alias)/.+$").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsMasterKey {
    pub arn: String,
    #[serde(with = "crate::timestamp::rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_profile: Option<String>,
}

impl KmsMasterKey {
    pub fn new(arn: &str) -> Result<Self> {
        let arn = arn.trim();
        if !ARN_RE.is_match(arn) {
            return Err(Error::MalformedMetadata(format!(
                "not a valid KMS key ARN: {arn:?}"
            )));
        }
        Ok(KmsMasterKey {
            arn: arn.to_string(),
            created_at: Utc::now(),
            enc: String::new(),
            role: None,
            context: None,
            aws_profile: None,
        })
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    pub fn with_context(mut self, context: Option<BTreeMap<String, String>>) -> Self {
        self.context = context;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.aws_profile = profile;
        self
    }

    fn region(&self) -> Result<String> {
        self.arn
            .split(':')
            .nth(3)
            .map(str::to_string)
            .ok_or_else(|| Error::MalformedMetadata(format!("no region in ARN {:?}", self.arn)))
    }

    fn encryption_context(&self) -> Option<HashMap<String, String>> {
        self.context
            .as_ref()
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn client(&self) -> Result<aws_sdk_kms::Client> {
        let region = Region::new(self.region()?);
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region.clone());
        if let Some(profile) = &self.aws_profile {
            loader = loader.profile_name(profile);
        }
        let base = loader.load().await;
        let config = match &self.role {
            None => base,
            Some(role) => {
                let provider = aws_config::sts::AssumeRoleProvider::builder(role)
                    .session_name("sealbox")
                    .region(region.clone())
                    .configure(&base)
                    .build()
                    .await;
                aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(provider)
                    .load()
                    .await
            }
        };
        Ok(aws_sdk_kms::Client::new(&config))
    }

    pub async fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        let client = self.client().await?;
        let response = client
            .encrypt()
            .key_id(&self.arn)
            .plaintext(Blob::new(data_key))
            .set_encryption_context(self.encryption_context())
            .send()
            .await
            .map_err(|e| Error::master_key("kms", &self.arn, DisplayErrorContext(e)))?;
        let blob = response.ciphertext_blob().ok_or_else(|| {
            Error::master_key("kms", &self.arn, "Encrypt returned no ciphertext")
        })?;
        self.enc = BASE64.encode(blob.as_ref());
        Ok(())
    }

    pub async fn decrypt(&self) -> Result<Vec<u8>> {
        if self.enc.is_empty() {
            return Err(Error::master_key(
                "kms",
                &self.arn,
                "no wrapped data key present",
            ));
        }
        let wrapped = BASE64.decode(&self.enc)?;
        let client = self.client().await?;
        let response = client
            .decrypt()
            .ciphertext_blob(Blob::new(wrapped))
            .set_encryption_context(self.encryption_context())
            .send()
            .await
            .map_err(|e| Error::master_key("kms", &self.arn, DisplayErrorContext(e)))?;
        let plaintext = response.plaintext().ok_or_else(|| {
            Error::master_key("kms", &self.arn, "Decrypt returned no plaintext")
        })?;
        Ok(plaintext.as_ref().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arn_validation_and_region_extraction() {
        let key =
            KmsMasterKey::new("arn:aws:kms:us-east-1:123456789012:key/12345678-abcd").unwrap();
        assert_eq!(key.region().unwrap(), "us-east-1");

        assert!(KmsMasterKey::new("arn:aws:iam::123456789012:role/foo").is_err());
        assert!(KmsMasterKey::new("not-an-arn").is_err());
    }

    #[test]
    fn alias_arns_are_accepted() {
        let key = KmsMasterKey::new(
            "arn:aws-cn:kms:cn-north-1:000000000000:alias/my-alias",
        )
        .unwrap();
        assert_eq!(key.region().unwrap(), "cn-north-1");
    }
}
