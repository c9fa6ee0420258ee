//! Delegation seam for master-key operations.
//!
//! Wrap and unwrap calls go through a `KeyService` so that a deployment
//! can route them to an external custodian process instead of executing
//! them in-process. The transport for a remote service is out of scope;
//! the core only depends on the trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::keys::MasterKey;

#[async_trait]
pub trait KeyService: Send + Sync {
    /// Wraps the data key (or group share) under `key`, storing the
    /// blob in the key. A no-op when the key already holds a blob.
    async fn wrap(&self, key: &mut MasterKey, data_key: &[u8]) -> Result<()>;

    /// Unwraps and returns the data key (or group share) held by `key`.
    async fn unwrap(&self, key: &MasterKey) -> Result<Vec<u8>>;
}

/// Executes every operation in-process against the key's own backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalKeyService;

#[async_trait]
impl KeyService for LocalKeyService {
    async fn wrap(&self, key: &mut MasterKey, data_key: &[u8]) -> Result<()> {
        key.encrypt_if_needed(data_key).await
    }

    async fn unwrap(&self, key: &MasterKey) -> Result<Vec<u8>> {
        key.decrypt().await
    }
}
