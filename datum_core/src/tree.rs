//! Recursive content tree and directory fingerprinting.
//!
//! A tracked path is either a single file or a directory. Directories are
//! fingerprinted from their children alone: each child contributes
//!
//! ```text
//! 1 byte   kind (1=file, 2=dir)
//! 32 bytes child fingerprint
//! 1 byte   name_len
//! N bytes  name (UTF-8)
//! ```
//!
//! with children ordered bytewise by name. Timestamps, permissions and the
//! absolute location of the tree never enter the digest.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Maximum length of a single entry name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Entry kind, as encoded into directory fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File = 1,
    Dir = 2,
}

impl EntryKind {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A file leaf: its content fingerprint and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub hash: Hash,
    pub size: u64,
}

/// A directory with its children keyed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    hash: Hash,
    size: u64,
    file_count: u64,
    children: BTreeMap<String, Node>,
}

/// A node in a content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileEntry),
    Dir(DirEntry),
}

/// Validate a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_entry("Name cannot be empty"));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_entry(format!(
            "Name too long: {} bytes (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if name.contains('\0') {
        return Err(Error::invalid_entry("Name cannot contain null bytes"));
    }

    if name.contains(['\n', '\r']) {
        return Err(Error::invalid_entry("Name cannot contain line breaks"));
    }

    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::invalid_entry(format!(
            "Name must be a single path component: {}",
            name
        )));
    }

    Ok(())
}

impl DirEntry {
    /// Build a directory from its children, computing its fingerprint and totals.
    pub fn new(algorithm: Algorithm, children: BTreeMap<String, Node>) -> Result<Self> {
        for name in children.keys() {
            validate_name(name)?;
        }

        let mut hasher = algorithm.hasher();
        let mut size = 0u64;
        let mut file_count = 0u64;

        for (name, child) in &children {
            hasher.update(&[child.kind().to_u8()]);
            hasher.update(child.hash().as_bytes());
            hasher.update(&[name.len() as u8]);
            hasher.update(name.as_bytes());

            size = size
                .checked_add(child.size())
                .ok_or_else(|| Error::invalid_entry(format!("total size overflows at {}", name)))?;
            file_count = file_count
                .checked_add(child.file_count())
                .ok_or_else(|| Error::invalid_entry(format!("file count overflows at {}", name)))?;
        }

        Ok(Self {
            hash: hasher.finalize(),
            size,
            file_count,
            children,
        })
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn children(&self) -> &BTreeMap<String, Node> {
        &self.children
    }
}

impl Node {
    /// Create a file leaf.
    pub fn file(hash: Hash, size: u64) -> Self {
        Node::File(FileEntry { hash, size })
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Node::File(_) => EntryKind::File,
            Node::Dir(_) => EntryKind::Dir,
        }
    }

    /// Fingerprint of this node.
    pub fn hash(&self) -> Hash {
        match self {
            Node::File(f) => f.hash,
            Node::Dir(d) => d.hash,
        }
    }

    /// Total size in bytes of all files below (or at) this node.
    pub fn size(&self) -> u64 {
        match self {
            Node::File(f) => f.size,
            Node::Dir(d) => d.size,
        }
    }

    /// Number of files below (or at) this node.
    pub fn file_count(&self) -> u64 {
        match self {
            Node::File(_) => 1,
            Node::Dir(d) => d.file_count,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    /// All files with their `/`-separated path relative to this node.
    ///
    /// A file root yields a single entry with an empty path.
    pub fn files(&self) -> Vec<(String, FileEntry)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files(&self, prefix: &str, out: &mut Vec<(String, FileEntry)>) {
        match self {
            Node::File(f) => out.push((prefix.to_string(), *f)),
            Node::Dir(d) => {
                for (name, child) in &d.children {
                    child.collect_files(&join(prefix, name), out);
                }
            }
        }
    }

    /// All directories with their path relative to this node, parents first.
    pub fn dirs(&self) -> Vec<(String, &DirEntry)> {
        let mut out = Vec::new();
        self.collect_dirs("", &mut out);
        out
    }

    fn collect_dirs<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a DirEntry)>) {
        if let Node::Dir(d) = self {
            out.push((prefix.to_string(), d));
            for (name, child) in &d.children {
                child.collect_dirs(&join(prefix, name), out);
            }
        }
    }

    /// Fingerprints of every file leaf (the cache entries this tree needs).
    pub fn leaf_hashes(&self) -> BTreeSet<Hash> {
        self.files().into_iter().map(|(_, f)| f.hash).collect()
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Kind of a file-level difference between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Present only in the new tree.
    Added,
    /// Present only in the old tree.
    Removed,
    /// Present in both with different content.
    Modified,
}

/// A single file-level difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    pub old: Option<Hash>,
    pub new: Option<Hash>,
}

/// Structural diff from `old` to `new`, at file granularity.
///
/// Subtrees with equal fingerprints are skipped without descending. Changes
/// are returned ordered by path.
pub fn diff(old: &Node, new: &Node) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_into("", old, new, &mut changes);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn diff_into(prefix: &str, old: &Node, new: &Node, out: &mut Vec<Change>) {
    if old.hash() == new.hash() && old.kind() == new.kind() {
        return;
    }

    match (old, new) {
        (Node::File(o), Node::File(n)) => out.push(Change {
            path: prefix.to_string(),
            kind: ChangeKind::Modified,
            old: Some(o.hash),
            new: Some(n.hash),
        }),
        (Node::Dir(o), Node::Dir(n)) => {
            for (name, old_child) in &o.children {
                let path = join(prefix, name);
                match n.children.get(name) {
                    Some(new_child) => diff_into(&path, old_child, new_child, out),
                    None => push_all(&path, old_child, ChangeKind::Removed, out),
                }
            }
            for (name, new_child) in &n.children {
                if !o.children.contains_key(name) {
                    push_all(&join(prefix, name), new_child, ChangeKind::Added, out);
                }
            }
        }
        // A file replaced by a directory or vice versa.
        _ => {
            push_all(prefix, old, ChangeKind::Removed, out);
            push_all(prefix, new, ChangeKind::Added, out);
        }
    }
}

fn push_all(prefix: &str, node: &Node, kind: ChangeKind, out: &mut Vec<Change>) {
    let mut files = Vec::new();
    node.collect_files(prefix, &mut files);
    for (path, file) in files {
        let (old, new) = match kind {
            ChangeKind::Removed => (Some(file.hash), None),
            _ => (None, Some(file.hash)),
        };
        out.push(Change {
            path,
            kind,
            old,
            new,
        });
    }
}
