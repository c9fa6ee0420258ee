//! YAML documents, including multi-document streams.
//!
//! Mapping order is preserved. Plain scalars shaped like RFC3339
//! timestamps are materialized as timestamp leaves so a decrypted
//! document round-trips them with their original offset. The metadata
//! envelope lives in the first document of a stream.

use serde::Deserialize;
use serde_yaml::{Mapping, Value as Yaml};

use crate::cipher::parse_timestamp;
use crate::error::{Error, Result};
use crate::metadata::{Metadata, StoredMetadata};
use crate::tree::{Tree, TreeBranch, TreeBranches, TreeItem, Value};

use super::METADATA_KEY;

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlStore;

impl YamlStore {
    pub fn new() -> Self {
        YamlStore
    }

    fn parse_documents(&self, content: &[u8]) -> Result<Vec<Mapping>> {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_slice(content) {
            let value = Yaml::deserialize(document)
                .map_err(|e| Error::Store(format!("invalid YAML: {e}")))?;
            match value {
                Yaml::Mapping(map) => documents.push(map),
                Yaml::Null => {}
                _ => {
                    return Err(Error::Store(
                        "top level of a YAML document must be a mapping".into(),
                    ))
                }
            }
        }
        if documents.is_empty() {
            return Err(Error::Store("no YAML documents found".into()));
        }
        Ok(documents)
    }

    fn emit_documents(&self, documents: &[Yaml]) -> Result<Vec<u8>> {
        let mut out = String::new();
        for (index, document) in documents.iter().enumerate() {
            if index > 0 {
                out.push_str("---\n");
            }
            out.push_str(
                &serde_yaml::to_string(document).map_err(|e| Error::Store(e.to_string()))?,
            );
        }
        Ok(out.into_bytes())
    }
}

impl super::Store for YamlStore {
    fn load_encrypted_file(&self, content: &[u8]) -> Result<Tree> {
        let mut documents = self.parse_documents(content)?;
        let stored = documents[0]
            .remove(METADATA_KEY)
            .ok_or_else(|| {
                Error::MalformedMetadata(format!("document has no {METADATA_KEY:?} key"))
            })?;
        let stored: StoredMetadata = serde_yaml::from_value(stored)
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        Ok(Tree {
            branches: documents
                .into_iter()
                .map(branch_from_mapping)
                .collect::<Result<_>>()?,
            metadata: Metadata::try_from(stored)?,
        })
    }

    fn load_plain_file(&self, content: &[u8]) -> Result<TreeBranches> {
        self.parse_documents(content)?
            .into_iter()
            .map(branch_from_mapping)
            .collect()
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>> {
        let mut documents: Vec<Yaml> = Vec::with_capacity(tree.branches.len());
        for (index, branch) in tree.branches.iter().enumerate() {
            let mut mapping = mapping_from_branch(branch)?;
            if index == 0 {
                let stored = serde_yaml::to_value(StoredMetadata::from(&tree.metadata))
                    .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
                mapping.insert(Yaml::String(METADATA_KEY.to_string()), stored);
            }
            documents.push(Yaml::Mapping(mapping));
        }
        self.emit_documents(&documents)
    }

    fn emit_plain_file(&self, branches: &TreeBranches) -> Result<Vec<u8>> {
        let documents: Vec<Yaml> = branches
            .iter()
            .map(|b| mapping_from_branch(b).map(Yaml::Mapping))
            .collect::<Result<_>>()?;
        self.emit_documents(&documents)
    }

    fn emit_value(&self, value: &Value) -> Result<Vec<u8>> {
        let yaml = value_to_yaml(value)?
            .ok_or_else(|| Error::Store("cannot emit a comment as YAML".into()))?;
        Ok(serde_yaml::to_string(&yaml)
            .map_err(|e| Error::Store(e.to_string()))?
            .into_bytes())
    }
}

fn branch_from_mapping(mapping: Mapping) -> Result<TreeBranch> {
    let mut branch = TreeBranch::new();
    for (key, value) in mapping {
        let key = scalar_key(&key)?;
        if branch
            .iter()
            .any(|item| matches!(item, TreeItem::Pair { key: k, .. } if *k == key))
        {
            return Err(Error::Store(format!("duplicate mapping key {key:?}")));
        }
        branch.push(TreeItem::Pair {
            key,
            value: yaml_to_value(value)?,
        });
    }
    Ok(branch)
}

fn scalar_key(key: &Yaml) -> Result<String> {
    match key {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        other => Err(Error::Store(format!("unsupported mapping key {other:?}"))),
    }
}

fn yaml_to_value(value: Yaml) -> Result<Value> {
    Ok(match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or_else(|| {
                Error::Store(format!("number {n} does not fit any supported type"))
            })?),
        },
        Yaml::String(s) => match parse_timestamp(&s) {
            Some(ts) => Value::Timestamp(ts),
            None => Value::String(s),
        },
        Yaml::Sequence(elements) => Value::Sequence(
            elements
                .into_iter()
                .map(yaml_to_value)
                .collect::<Result<_>>()?,
        ),
        Yaml::Mapping(mapping) => Value::Branch(branch_from_mapping(mapping)?),
        Yaml::Tagged(tagged) => yaml_to_value(tagged.value)?,
    })
}

fn mapping_from_branch(branch: &TreeBranch) -> Result<Mapping> {
    let mut mapping = Mapping::new();
    for item in branch {
        match item {
            TreeItem::Pair { key, value } => {
                if let Some(yaml) = value_to_yaml(value)? {
                    mapping.insert(Yaml::String(key.clone()), yaml);
                }
            }
            // serde_yaml has no comment model; encrypted comments come
            // back through dotenv or code-built trees only.
            TreeItem::Comment(_) => {}
        }
    }
    Ok(mapping)
}

fn value_to_yaml(value: &Value) -> Result<Option<Yaml>> {
    Ok(Some(match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Bool(*b),
        Value::Int(i) => Yaml::Number((*i).into()),
        Value::Float(f) => Yaml::Number((*f).into()),
        Value::String(s) => Yaml::String(s.clone()),
        Value::Bytes(b) => Yaml::String(String::from_utf8_lossy(b).into_owned()),
        Value::Timestamp(ts) => Yaml::String(timestamp_text(ts)),
        Value::Comment(_) => return Ok(None),
        Value::Sequence(elements) => Yaml::Sequence(
            elements
                .iter()
                .filter_map(|e| value_to_yaml(e).transpose())
                .collect::<Result<_>>()?,
        ),
        Value::Branch(branch) => Yaml::Mapping(mapping_from_branch(branch)?),
    }))
}

fn timestamp_text(ts: &chrono::DateTime<chrono::FixedOffset>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::super::Store;
    use super::*;

    #[test]
    fn plain_round_trip_preserves_order() {
        let input = b"name: app\nport: 8080\nlimits:\n  cpu: 0.5\n  mem: 2\ntags:\n- a\n- b\n";
        let store = YamlStore::new();
        let branches = store.load_plain_file(input).unwrap();
        let emitted = store.emit_plain_file(&branches).unwrap();
        assert_eq!(store.load_plain_file(&emitted).unwrap(), branches);
    }

    #[test]
    fn multi_document_streams_survive() {
        let input = b"a: 1\n---\nb: 2\n";
        let store = YamlStore::new();
        let branches = store.load_plain_file(input).unwrap();
        assert_eq!(branches.len(), 2);
        let emitted = store.emit_plain_file(&branches).unwrap();
        assert_eq!(store.load_plain_file(&emitted).unwrap(), branches);
    }

    #[test]
    fn rfc3339_scalars_become_timestamps() {
        let store = YamlStore::new();
        let branches = store
            .load_plain_file(b"deployed: 2006-01-02T15:04:05+07:00\nplain: hello\n")
            .unwrap();
        match &branches[0][0] {
            TreeItem::Pair {
                value: Value::Timestamp(ts),
                ..
            } => {
                assert_eq!(ts.offset().local_minus_utc(), 7 * 3600);
            }
            other => panic!("expected timestamp, got {other:?}"),
        }
        assert!(matches!(
            &branches[0][1],
            TreeItem::Pair {
                value: Value::String(_),
                ..
            }
        ));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let store = YamlStore::new();
        // serde_yaml itself rejects duplicate keys in one mapping.
        assert!(store.load_plain_file(b"a: 1\na: 2\n").is_err());
    }
}
