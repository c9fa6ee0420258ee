//! Opaque binary files.
//!
//! The file body becomes a single `data` leaf; the encrypted form is a
//! JSON document carrying that leaf and the metadata envelope, and
//! decryption emits the raw bytes back.

use crate::error::{Error, Result};
use crate::tree::{Tree, TreeBranch, TreeBranches, TreeItem, Value};

use super::{json::JsonStore, Store};

const DATA_KEY_NAME: &str = "data";

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryStore {
    json: JsonStore,
}

impl BinaryStore {
    pub fn new() -> Self {
        BinaryStore::default()
    }
}

impl Store for BinaryStore {
    fn load_encrypted_file(&self, content: &[u8]) -> Result<Tree> {
        self.json.load_encrypted_file(content)
    }

    fn load_plain_file(&self, content: &[u8]) -> Result<TreeBranches> {
        Ok(vec![vec![TreeItem::Pair {
            key: DATA_KEY_NAME.to_string(),
            value: Value::Bytes(content.to_vec()),
        }]])
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>> {
        self.json.emit_encrypted_file(tree)
    }

    fn emit_plain_file(&self, branches: &TreeBranches) -> Result<Vec<u8>> {
        let branch: &TreeBranch = branches
            .first()
            .ok_or_else(|| Error::Store("tree has no content".into()))?;
        let data = branch.iter().find_map(|item| match item {
            TreeItem::Pair { key, value } if key == DATA_KEY_NAME => Some(value),
            _ => None,
        });
        match data {
            Some(value) => value.to_bytes(),
            None => Err(Error::Store(format!(
                "binary document has no {DATA_KEY_NAME:?} key"
            ))),
        }
    }

    fn emit_value(&self, value: &Value) -> Result<Vec<u8>> {
        value.to_bytes()
    }
}
