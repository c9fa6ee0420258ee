//! The ordered, typed tree every document is parsed into.
//!
//! Stores translate their native representation (YAML documents, JSON
//! objects, dotenv lines) into this model; encryption, decryption and
//! MAC accumulation all run over it through a single walker so that the
//! visit order, and therefore the MAC, is identical everywhere.

use chrono::{DateTime, FixedOffset, SecondsFormat};

use crate::error::{Error, Result};
use crate::metadata::Metadata;

/// A scalar or container value at some position in a document.
///
/// Insertion order inside branches and sequences is significant and is
/// preserved end to end.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// A point in time with its original UTC offset. Offsets are whole
    /// minutes, as RFC3339 requires.
    Timestamp(DateTime<FixedOffset>),
    Comment(String),
    Branch(TreeBranch),
    Sequence(Vec<Value>),
    /// Explicit null in JSON/YAML input. Nulls pass through both walks
    /// untouched and contribute nothing to the MAC.
    Null,
}

/// One entry of a branch: either a keyed value or a free-standing
/// comment occupying a position of its own.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeItem {
    Pair { key: String, value: Value },
    Comment(String),
}

pub type TreeBranch = Vec<TreeItem>;

/// A document is one or more branches (YAML can carry several documents
/// in one file; every other format has exactly one).
pub type TreeBranches = Vec<TreeBranch>;

/// A parsed document plus the metadata envelope that travels with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub branches: TreeBranches,
    pub metadata: Metadata,
}

impl Value {
    /// The canonical byte form fed to both the leaf cipher and the MAC.
    ///
    /// Booleans are title-cased and floats use the shortest
    /// representation that round-trips; both are wire-compatible choices
    /// that must not follow native formatting.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Value::String(s) => Ok(s.clone().into_bytes()),
            Value::Int(i) => Ok(i.to_string().into_bytes()),
            Value::Float(f) => Ok(format_float(*f).into_bytes()),
            Value::Bool(true) => Ok(b"True".to_vec()),
            Value::Bool(false) => Ok(b"False".to_vec()),
            Value::Bytes(b) => Ok(b.clone()),
            Value::Timestamp(ts) => Ok(ts
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .into_bytes()),
            Value::Comment(c) => Ok(c.clone().into_bytes()),
            Value::Branch(_) => Err(Error::UnsupportedType("branch")),
            Value::Sequence(_) => Err(Error::UnsupportedType("sequence")),
            Value::Null => Err(Error::UnsupportedType("null")),
        }
    }
}

/// Shortest decimal form of a float that parses back to the same bits,
/// never in scientific notation.
pub(crate) fn format_float(f: f64) -> String {
    format!("{}", f)
}

/// The canonical textual form of a leaf path: components joined with
/// `:` plus a trailing `:`. This exact string is the AAD bound into the
/// leaf ciphertext and must be reproduced bit-identically.
pub fn canonical_path(path: &[String]) -> String {
    let mut out = String::with_capacity(path.iter().map(|c| c.len() + 1).sum());
    for component in path {
        out.push_str(component);
        out.push(':');
    }
    out
}

/// Options for a traversal. Comment entries are only visited when the
/// operation encrypts or decrypts comments.
#[derive(Debug, Clone, Copy)]
pub struct WalkOpts {
    pub visit_comments: bool,
}

impl Default for WalkOpts {
    fn default() -> Self {
        WalkOpts {
            visit_comments: true,
        }
    }
}

/// A visitor receives each leaf together with its path components and
/// returns the replacement value. The first error aborts the walk.
pub type Visitor<'a> = dyn FnMut(Value, &[String]) -> Result<Value> + 'a;

/// Visits every leaf of every branch exactly once, depth first, in
/// insertion order. Sequence positions appear in the path as decimal
/// strings; comment entries as `comment:<index>`.
pub fn walk_branches(
    branches: &mut TreeBranches,
    opts: WalkOpts,
    visit: &mut Visitor<'_>,
) -> Result<()> {
    let mut path = Vec::new();
    for branch in branches.iter_mut() {
        walk_branch(branch, &mut path, opts, visit)?;
    }
    Ok(())
}

fn walk_branch(
    branch: &mut TreeBranch,
    path: &mut Vec<String>,
    opts: WalkOpts,
    visit: &mut Visitor<'_>,
) -> Result<()> {
    for (index, item) in branch.iter_mut().enumerate() {
        match item {
            TreeItem::Pair { key, value } => {
                path.push(key.clone());
                walk_value(value, path, opts, visit)?;
                path.pop();
            }
            TreeItem::Comment(text) => {
                if !opts.visit_comments {
                    continue;
                }
                path.push(format!("comment:{index}"));
                let replacement = visit(Value::Comment(std::mem::take(text)), path)?;
                *text = into_comment_text(replacement)?;
                path.pop();
            }
        }
    }
    Ok(())
}

fn walk_value(
    value: &mut Value,
    path: &mut Vec<String>,
    opts: WalkOpts,
    visit: &mut Visitor<'_>,
) -> Result<()> {
    match value {
        Value::Branch(branch) => walk_branch(branch, path, opts, visit),
        Value::Sequence(elements) => {
            for (index, element) in elements.iter_mut().enumerate() {
                path.push(index.to_string());
                walk_value(element, path, opts, visit)?;
                path.pop();
            }
            Ok(())
        }
        Value::Null => Ok(()),
        Value::Comment(_) if !opts.visit_comments => Ok(()),
        _ => {
            let leaf = std::mem::replace(value, Value::Null);
            *value = visit(leaf, path)?;
            Ok(())
        }
    }
}

/// A visitor may hand back either a comment (decryption) or a plain
/// string (the ciphertext produced by encryption) for a comment slot.
fn into_comment_text(value: Value) -> Result<String> {
    match value {
        Value::Comment(text) | Value::String(text) => Ok(text),
        other => Err(Error::Store(format!(
            "visitor returned {other:?} for a comment entry"
        ))),
    }
}
