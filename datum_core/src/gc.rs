//! Garbage collection.

use crate::error::Result;
use crate::hash::Hash;
use crate::manifest::Manifest;
use crate::store::Store;
use crate::tree::Node;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::time::SystemTime;
use tracing::{debug, info};

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Number of entries deleted (or that would be, in a dry run).
    pub objects_deleted: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
    /// Unreferenced entries spared because they were written or reused
    /// after the keep set was snapshotted.
    pub objects_protected: usize,
}

/// The set of fingerprints a collection must keep, plus the moment it was
/// started.
///
/// Start the snapshot *before* gathering manifests: any entry written or
/// reused by a concurrent add after that moment survives the sweep even
/// though it is missing from the set.
#[derive(Debug, Clone)]
pub struct KeepSet {
    started: SystemTime,
    hashes: HashSet<Hash>,
}

impl KeepSet {
    /// Begin a snapshot now.
    pub fn begin() -> Self {
        Self {
            started: SystemTime::now(),
            hashes: HashSet::new(),
        }
    }

    /// Keep every leaf of a content tree.
    pub fn add_node(&mut self, node: &Node) {
        self.hashes.extend(node.leaf_hashes());
    }

    /// Keep everything a manifest declares.
    pub fn add_manifest(&mut self, manifest: &Manifest) {
        self.add_node(manifest.root());
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl Extend<Hash> for KeepSet {
    fn extend<I: IntoIterator<Item = Hash>>(&mut self, iter: I) {
        self.hashes.extend(iter);
    }
}

impl Store {
    /// Remove every entry not in `keep`.
    ///
    /// The snapshot time is taken on entry; use [`Store::gc`] with a
    /// [`KeepSet`] begun before computing the set when adds may run
    /// concurrently.
    pub fn remove_unreferenced(&self, keep: &HashSet<Hash>, dry_run: bool) -> Result<GcStats> {
        let mut keep_set = KeepSet::begin();
        keep_set.extend(keep.iter().copied());
        self.gc(&keep_set, dry_run)
    }

    /// Run garbage collection against a keep set.
    ///
    /// If `dry_run` is true, reports what would be deleted without deleting.
    pub fn gc(&self, keep: &KeepSet, dry_run: bool) -> Result<GcStats> {
        let mut stats = GcStats::default();

        for (hash, obj_path) in self.entries()? {
            if keep.contains(&hash) {
                continue;
            }

            let metadata = match fs::metadata(&obj_path) {
                Ok(m) => m,
                // Removed by someone else in the meantime.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if metadata.modified()? >= keep.started {
                debug!(%hash, "protected: newer than snapshot");
                stats.objects_protected += 1;
                continue;
            }

            stats.bytes_freed += metadata.len();
            stats.objects_deleted += 1;

            if !dry_run {
                fs::remove_file(&obj_path)?;
                debug!(%hash, "deleted entry");
            }
        }

        // Remove empty shard directories (only if not dry run)
        if !dry_run {
            for shard_entry in fs::read_dir(self.objects_dir())? {
                let shard_path = shard_entry?.path();
                if shard_path.is_dir()
                    && let Ok(mut entries) = fs::read_dir(&shard_path)
                    && entries.next().is_none()
                {
                    let _ = fs::remove_dir(&shard_path);
                }
            }
        }

        info!(
            deleted = stats.objects_deleted,
            bytes = stats.bytes_freed,
            protected = stats.objects_protected,
            dry_run,
            "garbage collection finished"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use filetime::FileTime;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_gc_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let stats = store.remove_unreferenced(&HashSet::new(), false).unwrap();
        assert_eq!(stats, GcStats::default());
    }

    #[test]
    fn test_gc_keeps_referenced() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let kept = store.put_blob(&b"kept"[..]).unwrap();
        let orphan = store.put_blob(&b"orphan"[..]).unwrap();

        let keep: HashSet<Hash> = [kept].into_iter().collect();
        let stats = store.remove_unreferenced(&keep, false).unwrap();

        assert_eq!(stats.objects_deleted, 1);
        assert!(stats.bytes_freed > 0);
        assert!(store.has(&kept));
        assert!(!store.has(&orphan));
    }

    #[test]
    fn test_gc_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let hash = store.put_blob(&b"orphan"[..]).unwrap();

        let stats = store.remove_unreferenced(&HashSet::new(), true).unwrap();
        assert_eq!(stats.objects_deleted, 1);
        assert!(store.has(&hash));

        let stats2 = store.remove_unreferenced(&HashSet::new(), false).unwrap();
        assert_eq!(stats2.objects_deleted, 1);
        assert!(!store.has(&hash));
    }

    #[test]
    fn test_gc_removes_empty_shards() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let hash = store.put_blob(&b"orphan"[..]).unwrap();
        let shard = store.object_path(&hash).parent().unwrap().to_path_buf();
        assert!(shard.exists());

        store.remove_unreferenced(&HashSet::new(), false).unwrap();
        assert!(!shard.exists());
    }

    #[test]
    fn test_gc_protects_entries_newer_than_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let old = store.put_blob(&b"old"[..]).unwrap();

        let keep = KeepSet::begin();
        std::thread::sleep(Duration::from_millis(50));
        // A concurrent add lands after the snapshot started.
        let fresh = store.put_blob(&b"fresh"[..]).unwrap();

        let stats = store.gc(&keep, false).unwrap();
        assert_eq!(stats.objects_deleted, 1);
        assert_eq!(stats.objects_protected, 1);
        assert!(!store.has(&old));
        assert!(store.has(&fresh));
    }

    #[test]
    fn test_gc_protects_reused_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let hash = store.put_blob(&b"shared"[..]).unwrap();

        let keep = KeepSet::begin();
        std::thread::sleep(Duration::from_millis(50));
        // Re-adding identical content refreshes the existing entry.
        store.put_blob(&b"shared"[..]).unwrap();

        let stats = store.gc(&keep, false).unwrap();
        assert_eq!(stats.objects_deleted, 0);
        assert!(store.has(&hash));
    }

    #[test]
    fn test_gc_protects_entry_persisted_after_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let hash = store.put_blob(&b"late arrival"[..]).unwrap();
        let raw = store.read_raw(&hash).unwrap();
        fs::remove_file(store.object_path(&hash)).unwrap();

        // Written well before the snapshot, renamed into place after it.
        let mut staged = tempfile::NamedTempFile::new_in(store.root().join("tmp")).unwrap();
        staged.write_all(&raw).unwrap();
        filetime::set_file_mtime(staged.path(), FileTime::from_unix_time(1_000_000, 0)).unwrap();

        let keep = KeepSet::begin();
        store.persist_entry(staged, &store.object_path(&hash)).unwrap();

        let stats = store.gc(&keep, false).unwrap();
        assert_eq!(stats.objects_deleted, 0);
        assert_eq!(stats.objects_protected, 1);
        assert_eq!(store.get_blob(&hash).unwrap(), b"late arrival");
    }

    #[test]
    fn test_keep_set_from_tree() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path().join("store"), Algorithm::Blake3).unwrap();

        let data = temp_dir.path().join("data");
        fs::create_dir(&data).unwrap();
        fs::write(data.join("a"), b"a").unwrap();
        fs::write(data.join("b"), b"b").unwrap();
        let node = store.add_path(&data).unwrap();
        let orphan = store.put_blob(&b"orphan"[..]).unwrap();

        let mut keep = KeepSet::begin();
        keep.add_node(&node);
        assert_eq!(keep.len(), 2);

        let stats = store.gc(&keep, false).unwrap();
        assert_eq!(stats.objects_deleted, 1);
        assert!(!store.has(&orphan));
        for hash in node.leaf_hashes() {
            assert!(store.has(&hash));
        }
    }
}
