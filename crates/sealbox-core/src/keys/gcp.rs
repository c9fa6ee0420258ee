//! GCP Cloud KMS master keys.
//!
//! Wrapping posts to the crypto key's `:encrypt` endpoint. The bearer
//! token comes from `GOOGLE_OAUTH_ACCESS_TOKEN` (or the gcloud SDK's
//! `CLOUDSDK_AUTH_ACCESS_TOKEN`); service-account flows live outside
//! the core.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const SDK_TOKEN_ENV: &str = "CLOUDSDK_AUTH_ACCESS_TOKEN";
const ENDPOINT: &str = "https://cloudkms.googleapis.com/v1";

static RESOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^projects/[^/]+/locations/[^/]+/keyRings/[^/]+/cryptoKeys/[^/]+$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcpKmsMasterKey {
    pub resource_id: String,
    #[serde(with = "crate::timestamp::rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub enc: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl GcpKmsMasterKey {
    pub fn new(resource_id: &str) -> Result<Self> {
        let resource_id = resource_id.trim().trim_matches('/');
        if !RESOURCE_RE.is_match(resource_id) {
            return Err(Error::MalformedMetadata(format!(
                "not a Cloud KMS crypto key resource id: {resource_id:?}"
            )));
        }
        Ok(GcpKmsMasterKey {
            resource_id: resource_id.to_string(),
            created_at: Utc::now(),
            enc: String::new(),
        })
    }

    fn token(&self) -> Result<String> {
        std::env::var(TOKEN_ENV)
            .or_else(|_| std::env::var(SDK_TOKEN_ENV))
            .map_err(|_| {
                Error::master_key(
                    "gcp_kms",
                    &self.resource_id,
                    format!("{TOKEN_ENV} not set"),
                )
            })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let endpoint = format!("{ENDPOINT}/{}:{action}", self.resource_id);
        let response = reqwest::Client::new()
            .post(&endpoint)
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::master_key("gcp_kms", &self.resource_id, e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::master_key(
                "gcp_kms",
                &self.resource_id,
                format!("{action} returned {status}: {detail}"),
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::master_key("gcp_kms", &self.resource_id, e))
    }

    pub async fn encrypt(&mut self, data_key: &[u8]) -> Result<()> {
        let body = serde_json::json!({ "plaintext": BASE64.encode(data_key) });
        let response: EncryptResponse = self.post("encrypt", body).await?;
        self.enc = response.ciphertext;
        Ok(())
    }

    pub async fn decrypt(&self) -> Result<Vec<u8>> {
        if self.enc.is_empty() {
            return Err(Error::master_key(
                "gcp_kms",
                &self.resource_id,
                "no wrapped data key present",
            ));
        }
        let body = serde_json::json!({ "ciphertext": self.enc });
        let response: DecryptResponse = self.post("decrypt", body).await?;
        Ok(BASE64.decode(response.plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_are_validated() {
        let key = GcpKmsMasterKey::new(
            "projects/acme/locations/global/keyRings/ops/cryptoKeys/settings",
        )
        .unwrap();
        assert_eq!(
            key.resource_id,
            "projects/acme/locations/global/keyRings/ops/cryptoKeys/settings"
        );

        assert!(GcpKmsMasterKey::new("projects/acme/cryptoKeys/settings").is_err());
        assert!(GcpKmsMasterKey::new("").is_err());
    }
}
