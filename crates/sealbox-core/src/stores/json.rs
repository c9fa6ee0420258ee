//! JSON documents.
//!
//! Object member order is preserved end to end. JSON has no comment
//! syntax, so comment items are dropped on emission; byte sequences
//! emit as strings.

use serde_json::{json, Map};

use crate::error::{Error, Result};
use crate::metadata::{Metadata, StoredMetadata};
use crate::tree::{Tree, TreeBranch, TreeBranches, TreeItem, Value};

use super::METADATA_KEY;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStore;

impl JsonStore {
    pub fn new() -> Self {
        JsonStore
    }

    fn parse(&self, content: &[u8]) -> Result<Map<String, serde_json::Value>> {
        match serde_json::from_slice(content) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::Store("top level of a JSON file must be an object".into())),
            Err(e) => Err(Error::Store(format!("invalid JSON: {e}"))),
        }
    }
}

impl super::Store for JsonStore {
    fn load_encrypted_file(&self, content: &[u8]) -> Result<Tree> {
        let mut map = self.parse(content)?;
        let stored = map.remove(METADATA_KEY).ok_or_else(|| {
            Error::MalformedMetadata(format!("document has no {METADATA_KEY:?} key"))
        })?;
        let stored: StoredMetadata = serde_json::from_value(stored)
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        Ok(Tree {
            branches: vec![branch_from_map(map)?],
            metadata: Metadata::try_from(stored)?,
        })
    }

    fn load_plain_file(&self, content: &[u8]) -> Result<TreeBranches> {
        Ok(vec![branch_from_map(self.parse(content)?)?])
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>> {
        let branch = tree
            .branches
            .first()
            .ok_or_else(|| Error::Store("tree has no content".into()))?;
        let mut map = map_from_branch(branch)?;
        let stored = serde_json::to_value(StoredMetadata::from(&tree.metadata))
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        map.insert(METADATA_KEY.to_string(), stored);
        render(&serde_json::Value::Object(map))
    }

    fn emit_plain_file(&self, branches: &TreeBranches) -> Result<Vec<u8>> {
        let branch = branches
            .first()
            .ok_or_else(|| Error::Store("tree has no content".into()))?;
        render(&serde_json::Value::Object(map_from_branch(branch)?))
    }

    fn emit_value(&self, value: &Value) -> Result<Vec<u8>> {
        let json = value_to_json(value)?
            .ok_or_else(|| Error::Store("cannot emit a comment as JSON".into()))?;
        render(&json)
    }
}

fn render(value: &serde_json::Value) -> Result<Vec<u8>> {
    let mut out =
        serde_json::to_vec_pretty(value).map_err(|e| Error::Store(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

fn branch_from_map(map: Map<String, serde_json::Value>) -> Result<TreeBranch> {
    map.into_iter()
        .map(|(key, value)| {
            Ok(TreeItem::Pair {
                key,
                value: json_to_value(value)?,
            })
        })
        .collect()
}

fn json_to_value(value: serde_json::Value) -> Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or_else(|| {
                Error::Store(format!("number {n} does not fit any supported type"))
            })?),
        },
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(elements) => Value::Sequence(
            elements
                .into_iter()
                .map(json_to_value)
                .collect::<Result<_>>()?,
        ),
        serde_json::Value::Object(map) => Value::Branch(branch_from_map(map)?),
    })
}

fn map_from_branch(branch: &TreeBranch) -> Result<Map<String, serde_json::Value>> {
    let mut map = Map::new();
    for item in branch {
        match item {
            TreeItem::Pair { key, value } => {
                if let Some(json) = value_to_json(value)? {
                    map.insert(key.clone(), json);
                }
            }
            // JSON cannot carry comments.
            TreeItem::Comment(_) => {}
        }
    }
    Ok(map)
}

fn value_to_json(value: &Value) -> Result<Option<serde_json::Value>> {
    Ok(Some(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| Error::Store(format!("non-finite float {f}")))?,
        Value::String(s) => json!(s),
        Value::Bytes(b) => json!(String::from_utf8_lossy(b)),
        Value::Timestamp(ts) => json!(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        Value::Comment(_) => return Ok(None),
        Value::Sequence(elements) => serde_json::Value::Array(
            elements
                .iter()
                .filter_map(|e| value_to_json(e).transpose())
                .collect::<Result<_>>()?,
        ),
        Value::Branch(branch) => serde_json::Value::Object(map_from_branch(branch)?),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use super::*;

    #[test]
    fn plain_round_trip_preserves_order_and_types() {
        let input = br#"{"name":"app","port":8080,"ratio":0.5,"debug":true,"tags":["a","b"],"empty":null,"nested":{"z":1,"a":2}}"#;
        let store = JsonStore::new();
        let branches = store.load_plain_file(input).unwrap();
        let emitted = store.emit_plain_file(&branches).unwrap();
        let reparsed = store.load_plain_file(&emitted).unwrap();
        assert_eq!(branches, reparsed);

        let branch = &branches[0];
        let keys: Vec<&str> = branch
            .iter()
            .map(|item| match item {
                TreeItem::Pair { key, .. } => key.as_str(),
                TreeItem::Comment(_) => "#",
            })
            .collect();
        assert_eq!(
            keys,
            vec!["name", "port", "ratio", "debug", "tags", "empty", "nested"]
        );
    }

    #[test]
    fn documents_without_metadata_are_rejected_as_encrypted() {
        let store = JsonStore::new();
        let err = store.load_encrypted_file(br#"{"a":1}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn non_object_top_level_is_rejected() {
        let store = JsonStore::new();
        assert!(store.load_plain_file(b"[1,2,3]").is_err());
        assert!(store.load_plain_file(b"not json").is_err());
    }

    #[test]
    fn emit_value_renders_scalars() {
        let store = JsonStore::new();
        assert_eq!(
            store.emit_value(&Value::String("x".into())).unwrap(),
            b"\"x\"\n".to_vec()
        );
        assert_eq!(store.emit_value(&Value::Int(3)).unwrap(), b"3\n".to_vec());
    }
}
