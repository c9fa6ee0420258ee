//! Value-level encryption for structured configuration documents.
//!
//! A document is parsed (by a [`stores::Store`]) into an ordered
//! [`tree::Tree`] whose scalar leaves are sealed individually with
//! AES-256-GCM under a per-document data key, leaving keys and
//! structure in cleartext so encrypted files stay diffable and
//! mergeable. The data key itself is wrapped by one or more master-key
//! custodians ([`keys::MasterKey`]) such as cloud KMS services, OpenPGP
//! recipients, age recipients and Vault transit keys, optionally behind
//! a Shamir quorum across key groups. A SHA-512 MAC over the cleartext
//! leaves, itself sealed with the data key, proves integrity.
//!
//! The flow for one document is sequential: recover the data key, walk
//! the tree decrypting leaves, verify the MAC. Encryption walks the
//! tree sealing leaves, then seals the MAC and wraps the data key.
//! Only master-key operations touch the network; everything else is
//! pure CPU work, and tree traversal is never parallelized because the
//! MAC depends on visit order.

pub mod cipher;
pub mod error;
pub mod keys;
pub mod keyservice;
pub mod mac;
pub mod metadata;
pub mod policy;
pub mod shamir;
pub mod stores;
pub mod tree;

mod timestamp;

pub use cipher::Cipher;
pub use error::{Error, Result};
pub use keys::{
    AgeMasterKey, AzureKeyVaultMasterKey, GcpKmsMasterKey, KeyGroup, KmsMasterKey, MasterKey,
    PgpMasterKey, VaultTransitMasterKey,
};
pub use keyservice::{KeyService, LocalKeyService};
pub use metadata::{DataKey, Metadata};
pub use policy::SelectionPolicy;
pub use tree::{Tree, TreeBranch, TreeBranches, TreeItem, Value};

use mac::{mac_equal, MacBuilder};
use tracing::warn;
use tree::{canonical_path, walk_branches, WalkOpts};

/// Encrypts every selected leaf of the tree in place and seals the MAC
/// into the metadata.
///
/// The MAC accumulates the canonical bytes of every visited cleartext
/// leaf (only the selected ones when the document opts into
/// `mac_only_encrypted`) before the leaf is replaced by its
/// ciphertext. The digest is then sealed under the last-modified
/// timestamp so metadata and MAC cannot be re-paired independently.
pub fn encrypt_tree(tree: &mut Tree, data_key: &DataKey, cipher: &mut Cipher) -> Result<()> {
    let policy = tree.metadata.policy.clone();
    let mac_only_encrypted = tree.metadata.mac_only_encrypted;
    let mut mac = MacBuilder::new();

    walk_branches(&mut tree.branches, WalkOpts::default(), &mut |value, path| {
        let selected = policy.should_encrypt(path);
        if selected || !mac_only_encrypted {
            mac.add(&value.to_bytes()?);
        }
        if !selected {
            return Ok(value);
        }
        let ciphertext = cipher.encrypt(&value, data_key.as_bytes(), &canonical_path(path))?;
        Ok(Value::String(ciphertext))
    })?;

    tree.metadata.mac = cipher.encrypt(
        &Value::String(mac.finish()),
        data_key.as_bytes(),
        &tree.metadata.last_modified_rfc3339(),
    )?;
    Ok(())
}

/// Decrypts every encrypted leaf of the tree in place, recomputes the
/// MAC over the recovered cleartext, and verifies it against the
/// metadata in constant time.
///
/// With `ignore_mac` a failed verification degrades to a warning;
/// otherwise it surfaces as [`Error::MacMismatch`]. Returns the
/// freshly computed digest.
pub fn decrypt_tree(
    tree: &mut Tree,
    data_key: &DataKey,
    cipher: &mut Cipher,
    ignore_mac: bool,
) -> Result<String> {
    let mac_only_encrypted = tree.metadata.mac_only_encrypted;
    let mut mac = MacBuilder::new();

    walk_branches(&mut tree.branches, WalkOpts::default(), &mut |value, path| {
        let sealed = match &value {
            Value::String(s) if cipher::is_encrypted(s) => Some(s.clone()),
            Value::Comment(s) if cipher::is_encrypted(s) => Some(s.clone()),
            _ => None,
        };
        match sealed {
            Some(ciphertext) => {
                let plaintext =
                    cipher.decrypt(&ciphertext, data_key.as_bytes(), &canonical_path(path))?;
                mac.add(&plaintext.to_bytes()?);
                Ok(plaintext)
            }
            None => {
                if !mac_only_encrypted {
                    mac.add(&value.to_bytes()?);
                }
                Ok(value)
            }
        }
    })?;

    let digest = mac.finish();
    let stored = cipher
        .decrypt(
            &tree.metadata.mac,
            data_key.as_bytes(),
            &tree.metadata.last_modified_rfc3339(),
        )
        .ok()
        .and_then(|value| match value {
            Value::String(hex) => Some(hex),
            _ => None,
        });
    let verified = stored.as_deref().is_some_and(|hex| mac_equal(&digest, hex));
    if !verified {
        if !ignore_mac {
            return Err(Error::MacMismatch);
        }
        warn!("MAC verification failed; continuing because MAC checking is disabled");
    }
    Ok(digest)
}
