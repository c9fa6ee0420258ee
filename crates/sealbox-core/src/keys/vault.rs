//! Hashicorp Vault transit master keys.
//!
//! Wrapping defers to the transit engine's encrypt endpoint; the
//! wrapped blob is Vault's own `vault:v1:...` ciphertext string. The
//! token comes from `VAULT_TOKEN`, matching how the Vault CLI
//! authenticates.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

pub const TOKEN_ENV: &str = "VAULT_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultTransitMasterKey {
    pub vault_address: String,
    pub engine_path: String,
    pub key_name: String,
    #[serde(with = "crate::timestamp::rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub enc: String,
}

/// Vault wraps every response body in a `data` object.
#[derive(Deserialize)]
struct VaultResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

impl VaultTransitMasterKey {
    pub fn new(vault_address: &str, engine_path: &str, key_name: &str) -> Result<Self> {
        Url::parse(vault_address)
            .map_err(|e| Error::MalformedMetadata(format!("vault address: {e}")))?;
        Ok(VaultTransitMasterKey {
            vault_address: vault_address.trim_end_matches('/').to_string(),
            engine_path: engine_path.trim_matches('/').to_string(),
            key_name: key_name.to_string(),
            created_at: Utc::now(),
            enc: String::new(),
        })
    }

    /// Accepts the `https://vault:8200/v1/<engine>/keys/<name>` form
    /// printed by `vault read`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::MalformedMetadata(format!("{uri:?}: {e}")))?;
        let path = url.path().trim_matches('/');
        let (engine, name) = path
            .strip_prefix("v1/")
            .and_then(|p| p.split_once("/keys/"))
            .ok_or_else(|| {
                Error::MalformedMetadata(format!(
                    "expected .../v1/<engine>/keys/<name>, got {uri:?}"
                ))
            })?;
        let address = format!(
            "{}://{}",
            url.scheme(),
            url.port()
                .map(|p| format!("{}:{p}", url.host_str().unwrap_or_default()))
                .unwrap_or_else(|| url.host_str().unwrap_or_default().to_string())
        );
        VaultTransitMasterKey::new(&address, engine, name)
    }

    pub fn identifier(&self) -> String {
        format!(
            "{}/v1/{}/keys/{}",
            self.vault_address, self.engine_path, self.key_name
        )
    }

    fn token(&self) -> Result<String> {
        std::env::var(TOKEN_ENV).map_err(|_| {
            Error::master_key("hc_vault", self.identifier(), format!("{TOKEN_ENV} not set"))
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.vault_address, self.engine_path, operation, self.key_name
        )
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = reqwest::Client::new()
            .post(self.endpoint(operation))
            .header("X-Vault-Token", self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::master_key("hc_vault", self.identifier(), e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::master_key(
                "hc_vault",
                self.identifier(),
                format!("{operation} returned {status}: {detail}"),
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::master_key("hc_vault", self.identifier(), e))
    }

    pub async fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        let body = serde_json::json!({ "plaintext": BASE64.encode(data_key) });
        let response: VaultResponse<EncryptData> = self.post("encrypt", body).await?;
        self.enc = response.data.ciphertext;
        Ok(())
    }

    pub async fn decrypt(&self) -> Result<Vec<u8>> {
        if self.enc.is_empty() {
            return Err(Error::master_key(
                "hc_vault",
                self.identifier(),
                "no wrapped data key present",
            ));
        }
        let body = serde_json::json!({ "ciphertext": self.enc });
        let response: VaultResponse<DecryptData> = self.post("decrypt", body).await?;
        Ok(BASE64.decode(response.data.plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_form_is_parsed() {
        let key =
            VaultTransitMasterKey::from_uri("https://vault.example:8200/v1/transit/keys/db")
                .unwrap();
        assert_eq!(key.vault_address, "https://vault.example:8200");
        assert_eq!(key.engine_path, "transit");
        assert_eq!(key.key_name, "db");
        assert_eq!(
            key.identifier(),
            "https://vault.example:8200/v1/transit/keys/db"
        );
    }

    #[test]
    fn nested_engine_paths_survive() {
        let key = VaultTransitMasterKey::from_uri(
            "http://127.0.0.1:8200/v1/teams/alpha/transit/keys/app",
        )
        .unwrap();
        assert_eq!(key.engine_path, "teams/alpha/transit");
        assert_eq!(key.endpoint("encrypt"), "http://127.0.0.1:8200/v1/teams/alpha/transit/encrypt/app");
    }

    #[test]
    fn malformed_uris_are_rejected() {
        assert!(VaultTransitMasterKey::from_uri("https://vault.example/transit/db").is_err());
        assert!(VaultTransitMasterKey::from_uri("not a url").is_err());
    }
}
