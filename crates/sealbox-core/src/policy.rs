//! Per-path decision of whether a leaf is encrypted.
//!
//! Exactly one rule is active per document. Suffix rules look at the
//! last path component; regex rules match every component
//! independently. The MAC always covers the cleartext regardless of
//! the decision here (unless the document opts into
//! `mac_only_encrypted`).

use regex::Regex;

use crate::error::{Error, Result};

pub const DEFAULT_UNENCRYPTED_SUFFIX: &str = "_unencrypted";

#[derive(Debug, Clone)]
pub enum SelectionPolicy {
    /// Leaves whose key ends with the suffix stay cleartext.
    UnencryptedSuffix(String),
    /// Only leaves whose key ends with the suffix are encrypted.
    EncryptedSuffix(String),
    /// Leaves under a component matching the regex stay cleartext.
    UnencryptedRegex(Regex),
    /// Only leaves under a component matching the regex are encrypted.
    EncryptedRegex(Regex),
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::UnencryptedSuffix(DEFAULT_UNENCRYPTED_SUFFIX.to_string())
    }
}

impl PartialEq for SelectionPolicy {
    fn eq(&self, other: &Self) -> bool {
        use SelectionPolicy::*;
        match (self, other) {
            (UnencryptedSuffix(a), UnencryptedSuffix(b)) => a == b,
            (EncryptedSuffix(a), EncryptedSuffix(b)) => a == b,
            (UnencryptedRegex(a), UnencryptedRegex(b)) => a.as_str() == b.as_str(),
            (EncryptedRegex(a), EncryptedRegex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl SelectionPolicy {
    pub fn unencrypted_regex(pattern: &str) -> Result<Self> {
        Ok(SelectionPolicy::UnencryptedRegex(compile(pattern)?))
    }

    pub fn encrypted_regex(pattern: &str) -> Result<Self> {
        Ok(SelectionPolicy::EncryptedRegex(compile(pattern)?))
    }

    /// Whether the leaf at `path` is to be encrypted.
    pub fn should_encrypt(&self, path: &[String]) -> bool {
        match self {
            SelectionPolicy::UnencryptedSuffix(suffix) => {
                !last_component(path).is_some_and(|c| c.ends_with(suffix.as_str()))
            }
            SelectionPolicy::EncryptedSuffix(suffix) => {
                last_component(path).is_some_and(|c| c.ends_with(suffix.as_str()))
            }
            SelectionPolicy::UnencryptedRegex(re) => !path.iter().any(|c| re.is_match(c)),
            SelectionPolicy::EncryptedRegex(re) => path.iter().any(|c| re.is_match(c)),
        }
    }
}

fn last_component(path: &[String]) -> Option<&String> {
    path.last()
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::MalformedMetadata(format!("invalid selection regex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(components: &[&str]) -> Vec<String> {
        components.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn default_suffix_exempts_marked_leaves() {
        let policy = SelectionPolicy::default();
        assert!(policy.should_encrypt(&path(&["db", "password"])));
        assert!(!policy.should_encrypt(&path(&["db", "host_unencrypted"])));
    }

    #[test]
    fn encrypted_suffix_selects_only_marked_leaves() {
        let policy = SelectionPolicy::EncryptedSuffix("_secret".into());
        assert!(policy.should_encrypt(&path(&["api", "token_secret"])));
        assert!(!policy.should_encrypt(&path(&["api", "endpoint"])));
    }

    #[test]
    fn regex_rules_match_any_component() {
        let policy = SelectionPolicy::unencrypted_regex("^public_").unwrap();
        assert!(!policy.should_encrypt(&path(&["public_keys", "ed25519"])));
        assert!(policy.should_encrypt(&path(&["private", "ed25519"])));

        let policy = SelectionPolicy::encrypted_regex("^secret").unwrap();
        assert!(policy.should_encrypt(&path(&["secrets", "a"])));
        assert!(!policy.should_encrypt(&path(&["plain", "a"])));
    }
}
