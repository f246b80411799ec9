//! Filesystem walking: content fingerprints and adding trees to the store.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, CancelFlag};
use crate::store::Store;
use crate::tree::{DirEntry, Node, validate_name};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Per-directory ignore file, gitignore syntax.
pub const IGNORE_FILENAME: &str = ".datumignore";

/// Counters from an add.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddStats {
    /// Leaves whose content was new to the store.
    pub files_stored: u64,
    /// Leaves already present in the store and skipped.
    pub files_deduplicated: u64,
}

/// Walks a file or directory and computes its content tree.
///
/// With a store attached, every leaf not yet in the store is written to it.
/// Children of a directory are processed in parallel on the current rayon
/// pool.
pub struct Walker<'a> {
    algorithm: Algorithm,
    store: Option<&'a Store>,
    cancel: Option<&'a CancelFlag>,
    skip_unhashable: bool,
    skipped: Mutex<Vec<PathBuf>>,
    stored: AtomicU64,
    deduplicated: AtomicU64,
}

impl<'a> Walker<'a> {
    /// A walker that only hashes.
    pub fn hashing(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            store: None,
            cancel: None,
            skip_unhashable: false,
            skipped: Mutex::new(Vec::new()),
            stored: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
        }
    }

    /// A walker that hashes and stores new leaves in `store`.
    pub fn storing(store: &'a Store) -> Self {
        Self {
            store: Some(store),
            ..Self::hashing(store.algorithm())
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Leave out entries below the root that cannot be hashed (symlinks,
    /// unreadable files, invalid names) instead of failing the walk.
    pub fn skipping_unhashable(mut self) -> Self {
        self.skip_unhashable = true;
        self
    }

    /// Paths left out by [`Walker::skipping_unhashable`], sorted.
    pub fn skipped(&self) -> Vec<PathBuf> {
        let mut paths = match self.skipped.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        paths.sort();
        paths
    }

    fn record_skip(&self, path: &Path, reason: &dyn std::fmt::Display) {
        debug!(path = %path.display(), %reason, "skipped unhashable entry");
        match self.skipped.lock() {
            Ok(mut guard) => guard.push(path.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().push(path.to_path_buf()),
        }
    }

    pub fn stats(&self) -> AddStats {
        AddStats {
            files_stored: self.stored.load(Ordering::Relaxed),
            files_deduplicated: self.deduplicated.load(Ordering::Relaxed),
        }
    }

    /// Compute the tree for `path`.
    pub fn walk(&self, path: &Path) -> Result<Node> {
        let metadata = fs::symlink_metadata(path).map_err(|e| Error::unreadable_input(path, e))?;

        if metadata.is_file() {
            self.file_node(path)
        } else if metadata.is_dir() {
            self.dir_node(path)
        } else {
            Err(Error::invalid_entry(format!(
                "Unsupported file type (symlinks are not tracked): {}",
                path.display()
            )))
        }
    }

    fn file_node(&self, path: &Path) -> Result<Node> {
        let (hash, size) = self.algorithm.hash_file(path, self.cancel)?;

        if let Some(store) = self.store {
            if store.has(&hash) {
                store.refresh(&hash)?;
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), %hash, "already cached");
            } else {
                let (stored_hash, _) = store.put_file(path, self.cancel)?;
                if stored_hash != hash {
                    return Err(Error::unreadable_input(
                        path,
                        std::io::Error::other("file changed while being added"),
                    ));
                }
                self.stored.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(Node::file(hash, size))
    }

    fn dir_node(&self, path: &Path) -> Result<Node> {
        let mut children = list_children(path)?;
        if self.skip_unhashable {
            children.retain(|(name, child_path)| match validate_name(name) {
                Ok(()) => true,
                Err(e) => {
                    self.record_skip(child_path, &e);
                    false
                }
            });
        }

        let nodes = children
            .par_iter()
            .map(|(name, child_path)| match self.walk(child_path) {
                Ok(node) => Ok(Some((name.clone(), node))),
                Err(e @ (Error::InvalidEntry { .. } | Error::UnreadableInput { .. }))
                    if self.skip_unhashable =>
                {
                    self.record_skip(child_path, &e);
                    Ok(None)
                }
                Err(e) => Err(e),
            })
            .collect::<Result<Vec<Option<(String, Node)>>>>()?;

        let map: BTreeMap<String, Node> = nodes.into_iter().flatten().collect();
        Ok(Node::Dir(DirEntry::new(self.algorithm, map)?))
    }
}

/// Immediate children of a directory, honoring `.datumignore` files.
fn list_children(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let walker = ignore::WalkBuilder::new(path)
        .max_depth(Some(1)) // Only immediate children
        .hidden(false) // Include hidden files
        .git_ignore(false) // Tracked data is usually git-ignored itself
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(true)
        .add_custom_ignore_filename(IGNORE_FILENAME)
        .build();

    let mut children = Vec::new();
    for entry in walker {
        let entry = entry?;
        let entry_path = entry.path();

        // Skip the directory itself
        if entry_path == path {
            continue;
        }

        let file_name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::invalid_entry(format!("Invalid filename: {}", entry_path.display()))
            })?
            .to_string();

        children.push((file_name, entry_path.to_path_buf()));
    }

    Ok(children)
}

/// Fingerprint a file or directory without storing anything.
pub fn hash_path(path: &Path, algorithm: Algorithm) -> Result<Node> {
    Walker::hashing(algorithm).walk(path)
}

impl Store {
    /// Add a file or directory to the store.
    ///
    /// Returns the content tree; leaves already present are not rewritten.
    pub fn add_path(&self, path: &Path) -> Result<Node> {
        let walker = Walker::storing(self);
        let node = walker.walk(path)?;
        let stats = walker.stats();
        debug!(
            path = %path.display(),
            hash = %node.hash(),
            stored = stats.files_stored,
            deduplicated = stats.files_deduplicated,
            "added path"
        );
        Ok(node)
    }
}
