//! Azure Key Vault master keys.
//!
//! Wrapping calls the key's `wrapkey` endpoint with RSA-OAEP-256. The
//! bearer token is taken from `AZURE_KV_TOKEN`; acquiring one (via the
//! CLI, managed identity or a service principal) is an authentication
//! concern outside the core.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

pub const TOKEN_ENV: &str = "AZURE_KV_TOKEN";
const API_VERSION: &str = "7.4";
const WRAP_ALGORITHM: &str = "RSA-OAEP-256";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureKeyVaultMasterKey {
    pub vault_url: String,
    pub name: String,
    pub version: String,
    #[serde(with = "crate::timestamp::rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub enc: String,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    value: String,
}

impl AzureKeyVaultMasterKey {
    pub fn new(vault_url: &str, name: &str, version: &str) -> Result<Self> {
        Url::parse(vault_url)
            .map_err(|e| Error::MalformedMetadata(format!("vault url: {e}")))?;
        Ok(AzureKeyVaultMasterKey {
            vault_url: vault_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            version: version.to_string(),
            created_at: Utc::now(),
            enc: String::new(),
        })
    }

    /// Accepts the `https://<vault>.vault.azure.net/keys/<name>/<version>`
    /// form shown in the portal.
    pub fn from_url(key_url: &str) -> Result<Self> {
        let url = Url::parse(key_url)
            .map_err(|e| Error::MalformedMetadata(format!("{key_url:?}: {e}")))?;
        let segments: Vec<&str> = url.path().trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["keys", name, version] => {
                let base = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
                AzureKeyVaultMasterKey::new(&base, name, version)
            }
            _ => Err(Error::MalformedMetadata(format!(
                "expected https://<vault>/keys/<name>/<version>, got {key_url:?}"
            ))),
        }
    }

    pub fn identifier(&self) -> String {
        format!("{}/keys/{}/{}", self.vault_url, self.name, self.version)
    }

    fn token(&self) -> Result<String> {
        std::env::var(TOKEN_ENV).map_err(|_| {
            Error::master_key(
                "azure_kv",
                self.identifier(),
                format!("{TOKEN_ENV} not set"),
            )
        })
    }

    async fn key_operation(&self, operation: &str, value: String) -> Result<String> {
        let endpoint = format!(
            "{}/keys/{}/{}/{operation}?api-version={API_VERSION}",
            self.vault_url, self.name, self.version
        );
        let body = serde_json::json!({ "alg": WRAP_ALGORITHM, "value": value });
        let response = reqwest::Client::new()
            .post(&endpoint)
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::master_key("azure_kv", self.identifier(), e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::master_key(
                "azure_kv",
                self.identifier(),
                format!("{operation} returned {status}: {detail}"),
            ));
        }
        let result: KeyOperationResult = response
            .json()
            .await
            .map_err(|e| Error::master_key("azure_kv", self.identifier(), e))?;
        Ok(result.value)
    }

    pub async fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        self.enc = self
            .key_operation("wrapkey", BASE64_URL.encode(data_key))
            .await?;
        Ok(())
    }

    pub async fn decrypt(&self) -> Result<Vec<u8>> {
        if self.enc.is_empty() {
            return Err(Error::master_key(
                "azure_kv",
                self.identifier(),
                "no wrapped data key present",
            ));
        }
        let value = self.key_operation("unwrapkey", self.enc.clone()).await?;
        Ok(BASE64_URL.decode(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_url_form_is_parsed() {
        let key = AzureKeyVaultMasterKey::from_url(
            "https://ops.vault.azure.net/keys/settings/fe86af79",
        )
        .unwrap();
        assert_eq!(key.vault_url, "https://ops.vault.azure.net");
        assert_eq!(key.name, "settings");
        assert_eq!(key.version, "fe86af79");
    }

    #[test]
    fn other_paths_are_rejected() {
        assert!(
            AzureKeyVaultMasterKey::from_url("https://ops.vault.azure.net/secrets/x/1").is_err()
        );
        assert!(AzureKeyVaultMasterKey::from_url("https://ops.vault.azure.net/keys/x").is_err());
    }
}
