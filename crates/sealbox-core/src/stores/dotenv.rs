//! dotenv files.
//!
//! One flat branch of `KEY=value` pairs and `#` comments. The format
//! has no nesting, so the metadata envelope is flattened into
//! `sops_`-prefixed entries: map fields append `__map_<key>` and list
//! positions `__list_<index>`, e.g. `sops_age__list_0__map_enc`.

use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::metadata::{Metadata, StoredMetadata};
use crate::tree::{Tree, TreeBranch, TreeBranches, TreeItem, Value};

use super::METADATA_KEY;

const PREFIX: &str = "sops_";

#[derive(Debug, Default, Clone, Copy)]
pub struct DotenvStore;

impl DotenvStore {
    pub fn new() -> Self {
        DotenvStore
    }

    fn parse(&self, content: &[u8]) -> Result<(TreeBranch, Vec<(String, String)>)> {
        let text = std::str::from_utf8(content)
            .map_err(|_| Error::Store("dotenv file is not UTF-8".into()))?;
        let mut branch = TreeBranch::new();
        let mut metadata_entries = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                branch.push(TreeItem::Comment(comment.to_string()));
                continue;
            }
            let (key, raw) = line.split_once('=').ok_or_else(|| {
                Error::Store(format!("expected KEY=value, got {line:?}"))
            })?;
            let value = unescape(raw);
            if let Some(flat_key) = key.strip_prefix(PREFIX) {
                metadata_entries.push((flat_key.to_string(), value));
            } else {
                branch.push(TreeItem::Pair {
                    key: key.to_string(),
                    value: Value::String(value),
                });
            }
        }
        Ok((branch, metadata_entries))
    }

    fn emit_branch(&self, branch: &TreeBranch, out: &mut String) -> Result<()> {
        for item in branch {
            match item {
                TreeItem::Comment(text) => {
                    out.push('#');
                    out.push_str(text);
                    out.push('\n');
                }
                TreeItem::Pair { key, value } => {
                    let text = match value {
                        Value::Branch(_) | Value::Sequence(_) => {
                            return Err(Error::Store(
                                "dotenv files cannot nest values".into(),
                            ))
                        }
                        Value::Null => String::new(),
                        other => String::from_utf8_lossy(&other.to_bytes()?).into_owned(),
                    };
                    out.push_str(key);
                    out.push('=');
                    out.push_str(&escape(&text));
                    out.push('\n');
                }
            }
        }
        Ok(())
    }
}

impl super::Store for DotenvStore {
    fn load_encrypted_file(&self, content: &[u8]) -> Result<Tree> {
        let (branch, entries) = self.parse(content)?;
        if entries.is_empty() {
            return Err(Error::MalformedMetadata(format!(
                "document has no {PREFIX}* entries for {METADATA_KEY:?}"
            )));
        }
        let stored: StoredMetadata = serde_json::from_value(unflatten(entries)?)
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        Ok(Tree {
            branches: vec![branch],
            metadata: Metadata::try_from(stored)?,
        })
    }

    fn load_plain_file(&self, content: &[u8]) -> Result<TreeBranches> {
        let (branch, _) = self.parse(content)?;
        Ok(vec![branch])
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>> {
        let branch = tree
            .branches
            .first()
            .ok_or_else(|| Error::Store("tree has no content".into()))?;
        let mut out = String::new();
        self.emit_branch(branch, &mut out)?;

        let stored = serde_json::to_value(StoredMetadata::from(&tree.metadata))
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        for (key, value) in flatten(&stored) {
            out.push_str(PREFIX);
            out.push_str(&key);
            out.push('=');
            out.push_str(&escape(&value));
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn emit_plain_file(&self, branches: &TreeBranches) -> Result<Vec<u8>> {
        let branch = branches
            .first()
            .ok_or_else(|| Error::Store("tree has no content".into()))?;
        let mut out = String::new();
        self.emit_branch(branch, &mut out)?;
        Ok(out.into_bytes())
    }

    fn emit_value(&self, value: &Value) -> Result<Vec<u8>> {
        value.to_bytes()
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Flattens the storage metadata into sorted (suffix, value) pairs.
fn flatten(stored: &Json) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    if let Json::Object(map) = stored {
        for (key, value) in map {
            flatten_into(&mut entries, key.clone(), value);
        }
    }
    entries
}

fn flatten_into(entries: &mut Vec<(String, String)>, prefix: String, value: &Json) {
    match value {
        Json::Object(map) => {
            for (key, nested) in map {
                flatten_into(entries, format!("{prefix}__map_{key}"), nested);
            }
        }
        Json::Array(elements) => {
            for (index, nested) in elements.iter().enumerate() {
                flatten_into(entries, format!("{prefix}__list_{index}"), nested);
            }
        }
        Json::String(s) => entries.push((prefix, s.clone())),
        Json::Bool(b) => entries.push((prefix, b.to_string())),
        Json::Number(n) => entries.push((prefix, n.to_string())),
        Json::Null => {}
    }
}

/// Rebuilds the storage metadata object from flattened entries.
fn unflatten(entries: Vec<(String, String)>) -> Result<Json> {
    let mut root = Map::new();
    for (flat_key, value) in entries {
        insert_path(&mut root, &flat_key, value)?;
    }
    let mut json = Json::Object(root);
    restore_scalar_types(&mut json);
    Ok(json)
}

fn insert_path(root: &mut Map<String, Json>, flat_key: &str, value: String) -> Result<()> {
    let mut segments = flat_key.split("__");
    let top = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedMetadata(format!("bad flattened key {flat_key:?}")))?;

    let mut slot: &mut Json = root.entry(top.to_string()).or_insert(Json::Null);
    for segment in segments {
        let current = slot;
        slot = if let Some(key) = segment.strip_prefix("map_") {
            if !current.is_object() {
                *current = Json::Object(Map::new());
            }
            current
                .as_object_mut()
                .expect("just made an object")
                .entry(key.to_string())
                .or_insert(Json::Null)
        } else if let Some(index) = segment.strip_prefix("list_") {
            let index: usize = index.parse().map_err(|_| {
                Error::MalformedMetadata(format!("bad list index in {flat_key:?}"))
            })?;
            if !current.is_array() {
                *current = Json::Array(Vec::new());
            }
            let list = current.as_array_mut().expect("just made an array");
            while list.len() <= index {
                list.push(Json::Null);
            }
            &mut list[index]
        } else {
            return Err(Error::MalformedMetadata(format!(
                "bad flattened key segment {segment:?} in {flat_key:?}"
            )));
        };
    }
    *slot = Json::String(value);
    Ok(())
}

/// The flat encoding stores everything as text; the two non-string
/// metadata fields get their types back here.
fn restore_scalar_types(json: &mut Json) {
    let Json::Object(map) = json else { return };
    if let Some(Json::String(s)) = map.get("shamir_threshold") {
        if let Ok(n) = s.parse::<u64>() {
            map.insert("shamir_threshold".into(), Json::Number(n.into()));
        }
    }
    if let Some(Json::String(s)) = map.get("mac_only_encrypted") {
        if let Ok(b) = s.parse::<bool>() {
            map.insert("mac_only_encrypted".into(), Json::Bool(b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use super::*;

    #[test]
    fn plain_round_trip_with_comments() {
        let input = b"# database settings\nDB_HOST=localhost\nDB_PASSWORD=hunter2\nNOTE=line one\\nline two\n";
        let store = DotenvStore::new();
        let branches = store.load_plain_file(input).unwrap();
        assert_eq!(branches[0].len(), 4);
        assert_eq!(
            branches[0][0],
            TreeItem::Comment(" database settings".into())
        );
        assert_eq!(
            branches[0][3],
            TreeItem::Pair {
                key: "NOTE".into(),
                value: Value::String("line one\nline two".into()),
            }
        );
        let emitted = store.emit_plain_file(&branches).unwrap();
        assert_eq!(emitted, input.to_vec());
    }

    #[test]
    fn flatten_and_unflatten_are_inverse() {
        let stored = serde_json::json!({
            "age": [{"recipient": "age1abc", "enc": "armor"}],
            "lastmodified": "2023-01-01T00:00:00Z",
            "mac": "ENC[...]",
            "shamir_threshold": 2,
            "mac_only_encrypted": true,
            "version": "0.4.2",
        });
        let entries = flatten(&stored);
        assert!(entries
            .iter()
            .any(|(k, _)| k == "age__list_0__map_recipient"));
        let rebuilt = unflatten(entries).unwrap();
        assert_eq!(rebuilt, stored);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let store = DotenvStore::new();
        assert!(store.load_plain_file(b"NOVALUE\n").is_err());
    }

    #[test]
    fn nested_values_cannot_be_emitted() {
        let store = DotenvStore::new();
        let branches = vec![vec![TreeItem::Pair {
            key: "NESTED".into(),
            value: Value::Branch(Vec::new()),
        }]];
        assert!(store.emit_plain_file(&branches).is_err());
    }
}
