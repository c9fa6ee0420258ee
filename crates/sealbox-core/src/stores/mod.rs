//! Format adapters.
//!
//! A store translates between a file format and the tree model, and
//! splits the metadata envelope out of (or folds it back into) the
//! document. The engine itself never touches bytes on disk; it only
//! sees trees.

pub mod binary;
pub mod dotenv;
pub mod json;
pub mod yaml;

pub use binary::BinaryStore;
pub use dotenv::DotenvStore;
pub use json::JsonStore;
pub use yaml::YamlStore;

use crate::error::Result;
use crate::tree::{Tree, TreeBranch, TreeBranches, TreeItem, Value};

/// The top-level key the metadata envelope lives under. Flat formats
/// use it as a `sops_` key prefix instead.
pub const METADATA_KEY: &str = "sops";

pub trait Store {
    /// Parses an encrypted document, separating content from metadata.
    fn load_encrypted_file(&self, content: &[u8]) -> Result<Tree>;

    /// Parses a cleartext document into branches.
    fn load_plain_file(&self, content: &[u8]) -> Result<TreeBranches>;

    /// Serializes tree and metadata back into the format.
    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>>;

    /// Serializes cleartext branches, with no metadata envelope.
    fn emit_plain_file(&self, branches: &TreeBranches) -> Result<Vec<u8>>;

    /// Serializes a single extracted value.
    fn emit_value(&self, value: &Value) -> Result<Vec<u8>>;
}

/// True when a branch already carries the metadata envelope at top
/// level, i.e. the document is encrypted.
pub fn has_metadata_key(branch: &TreeBranch) -> bool {
    branch
        .iter()
        .any(|item| matches!(item, TreeItem::Pair { key, .. } if key == METADATA_KEY))
}
