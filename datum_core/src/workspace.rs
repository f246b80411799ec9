//! Workspaces: tracked paths, pointer files and checkout.
//!
//! A workspace is a directory containing a `.datum/` metadata directory:
//!
//! ```text
//! .datum/
//!   config       workspace settings (algorithm, jobs, remotes)
//!   cache/       the cache store
//! ```
//!
//! Every tracked path `p` has a pointer file `p.datum` next to it. Adding a
//! path stores its content and rewrites the pointer file; checking out a
//! manifest reconciles the files on disk with the content it declares.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gc::{GcStats, KeepSet};
use crate::hash::{Algorithm, CancelFlag, Hash};
use crate::manifest::{Manifest, POINTER_EXTENSION, pointer_path};
use crate::remote::LocalRemote;
use crate::store::Store;
use crate::sync::{SyncEngine, SyncStatus, TransferReport, worker_pool};
use crate::tree::{Change, ChangeKind, FileEntry, Node, diff};
use crate::walk::{IGNORE_FILENAME, Walker};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the workspace metadata directory.
pub const DATUM_DIR: &str = ".datum";

const CONFIG_FILE: &str = "config";
const CACHE_DIR: &str = "cache";

/// Options for [`Workspace::checkout`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckoutOptions {
    /// Classify only; touch nothing.
    pub dry_run: bool,
    /// Overwrite or remove files even when their content is not cached.
    pub force: bool,
}

/// A declared file whose content is not in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFile {
    pub path: String,
    pub hash: Hash,
}

/// What a checkout did, or would do in a dry run.
///
/// Paths are workspace-relative and `/`-separated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckoutReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Declared files left as they are because their content is not cached.
    /// Pull from a remote and check out again to complete them.
    pub missing: Vec<MissingFile>,
    /// Workspace files that would be overwritten or removed although their
    /// current content is not cached.
    pub uncommitted: Vec<String>,
    /// Entries that could not be hashed, such as symlinks or unreadable
    /// files. They are left in place unless a declared file replaces them.
    pub skipped: Vec<String>,
    pub dry_run: bool,
}

impl CheckoutReport {
    /// True when the workspace already matched the manifest.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.missing.is_empty()
    }
}

/// How a tracked path compares with its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub path: String,
    /// The workspace content hashes to the declared fingerprint.
    pub in_sync: bool,
    /// File-level differences from the manifest to the workspace.
    pub changes: Vec<Change>,
    /// Declared fingerprints absent from the cache.
    pub missing_objects: Vec<Hash>,
    /// Entries that could not be hashed and were left out of `changes`.
    pub skipped: Vec<String>,
}

/// Which manifests a garbage collection keeps alive.
#[derive(Debug, Clone)]
pub enum GcScope {
    /// Every pointer file currently in the workspace.
    Workspace,
    /// Manifests chosen by the caller, for instance from every revision of
    /// source-control history.
    Manifests(Vec<Manifest>),
}

/// An open workspace with its cache store.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    config: Config,
    store: Store,
}

impl Workspace {
    /// Create a workspace at `root`.
    pub fn init<P: AsRef<Path>>(root: P, algorithm: Algorithm) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;

        let meta = root.join(DATUM_DIR);
        if meta.join(CONFIG_FILE).exists() {
            return Err(Error::invalid_store(&meta, "workspace already initialized"));
        }
        fs::create_dir_all(&meta)?;

        let config = Config::new(algorithm);
        config.save(&meta.join(CONFIG_FILE))?;
        // Keep the cache out of source control.
        fs::write(meta.join(".gitignore"), format!("/{}\n", CACHE_DIR))?;
        let store = Store::init(meta.join(CACHE_DIR), algorithm)?;

        info!(root = %root.display(), algo = %algorithm, "initialized workspace");
        Ok(Self {
            root,
            config,
            store,
        })
    }

    /// Open the workspace containing `path`, searching parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let start = path
            .canonicalize()
            .map_err(|e| Error::unreadable_input(path, e))?;

        let root = start
            .ancestors()
            .find(|dir| dir.join(DATUM_DIR).join(CONFIG_FILE).is_file())
            .ok_or_else(|| {
                Error::invalid_store(&start, "not inside a workspace (no .datum directory found)")
            })?
            .to_path_buf();

        let meta = root.join(DATUM_DIR);
        let config = Config::load(&meta.join(CONFIG_FILE))?;
        let store = Store::open(meta.join(CACHE_DIR))?;
        if store.algorithm() != config.algorithm {
            return Err(Error::invalid_config(format!(
                "workspace uses {} but its cache store uses {}",
                config.algorithm,
                store.algorithm()
            )));
        }

        Ok(Self {
            root,
            config,
            store,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Modify the configuration and save it.
    pub fn update_config<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut Config) -> Result<()>,
    {
        let mut config = self.config.clone();
        update(&mut config)?;
        if config.algorithm != self.store.algorithm() {
            return Err(Error::invalid_config(
                "the hash algorithm of an existing workspace cannot change",
            ));
        }
        config.save(&self.root.join(DATUM_DIR).join(CONFIG_FILE))?;
        self.config = config;
        Ok(())
    }

    /// Hash `path`, store new content and write its pointer file.
    ///
    /// `path` may be absolute or relative to the workspace root.
    pub fn add<P: AsRef<Path>>(&self, path: P) -> Result<Manifest> {
        self.add_inner(path.as_ref(), None)
    }

    /// Like [`Workspace::add`], abandoning the walk once `cancel` is set.
    ///
    /// Entries stored before cancellation stay in the cache; the pointer file
    /// is not touched.
    pub fn add_cancellable<P: AsRef<Path>>(&self, path: P, cancel: &CancelFlag) -> Result<Manifest> {
        self.add_inner(path.as_ref(), Some(cancel))
    }

    fn add_inner(&self, path: &Path, cancel: Option<&CancelFlag>) -> Result<Manifest> {
        let rel = self.relative(path)?;
        let target = self.absolute(&rel);

        let walker = match cancel {
            Some(flag) => Walker::storing(&self.store).with_cancel(flag),
            None => Walker::storing(&self.store),
        };
        let pool = worker_pool(self.config.jobs())?;
        let node = pool.install(|| walker.walk(&target))?;
        let stats = walker.stats();

        let manifest = Manifest::new(rel, self.store.algorithm(), node)?;
        manifest.save(&pointer_path(&target))?;

        info!(
            path = manifest.path(),
            hash = %manifest.hash(),
            files = manifest.file_count(),
            size = manifest.size(),
            stored = stats.files_stored,
            deduplicated = stats.files_deduplicated,
            "added"
        );
        Ok(manifest)
    }

    /// Make the workspace match `manifest`.
    ///
    /// Every declared and present file is classified before anything is
    /// written. Declared files whose content is not cached are reported under
    /// `missing` and left alone; files the manifest does not declare are
    /// removed. Overwriting or removing a file whose current content is not
    /// cached fails with [`Error::UncommittedChanges`] unless
    /// `options.force` is set.
    pub fn checkout(&self, manifest: &Manifest, options: CheckoutOptions) -> Result<CheckoutReport> {
        self.check_algorithm(manifest)?;
        let target = self.absolute(manifest.path());
        let pool = worker_pool(self.config.jobs())?;
        let (current, skipped) = pool.install(|| self.current_tree(&target))?;
        let skipped_set: HashSet<&str> = skipped.iter().map(String::as_str).collect();

        let declared: BTreeMap<String, FileEntry> = manifest.root().files().into_iter().collect();
        let present: BTreeMap<String, FileEntry> = current
            .as_ref()
            .map(|node| node.files().into_iter().collect())
            .unwrap_or_default();

        let declared_hashes: Vec<Hash> = declared.values().map(|f| f.hash).collect();
        let available = self.store.has_many(&declared_hashes);

        let mut report = CheckoutReport {
            skipped: skipped
                .iter()
                .map(|rel| workspace_path(manifest, rel))
                .collect(),
            dry_run: options.dry_run,
            ..CheckoutReport::default()
        };
        let mut writes: Vec<(String, Hash)> = Vec::new();
        let mut removals: Vec<String> = Vec::new();

        for (rel, entry) in &declared {
            let existing = present.get(rel);
            if existing.is_some_and(|cur| cur.hash == entry.hash) {
                report.unchanged.push(workspace_path(manifest, rel));
                continue;
            }
            if !available.contains(&entry.hash) {
                report.missing.push(MissingFile {
                    path: workspace_path(manifest, rel),
                    hash: entry.hash,
                });
                continue;
            }
            if existing.is_some() || skipped_set.contains(rel.as_str()) {
                report.modified.push(workspace_path(manifest, rel));
            } else {
                report.added.push(workspace_path(manifest, rel));
            }
            writes.push((rel.clone(), entry.hash));
        }

        for rel in present.keys() {
            if !declared.contains_key(rel) {
                report.removed.push(workspace_path(manifest, rel));
                removals.push(rel.clone());
            }
        }

        // Content about to be replaced or deleted must be recoverable.
        let at_risk: Vec<&String> = writes
            .iter()
            .map(|(rel, _)| rel)
            .filter(|rel| present.contains_key(*rel))
            .chain(removals.iter())
            .collect();
        let at_risk_hashes: Vec<Hash> = at_risk.iter().map(|rel| present[*rel].hash).collect();
        let cached = self.store.has_many(&at_risk_hashes);
        report.uncommitted = at_risk
            .iter()
            .filter(|rel| !cached.contains(&present[**rel].hash))
            .map(|rel| workspace_path(manifest, rel))
            .collect();
        // Unhashable entries in the way of a declared file cannot be recovered.
        report.uncommitted.extend(
            writes
                .iter()
                .filter(|(rel, _)| skipped_set.contains(rel.as_str()))
                .map(|(rel, _)| workspace_path(manifest, rel)),
        );
        report.uncommitted.sort();

        if options.dry_run {
            debug!(path = manifest.path(), "checkout dry run");
            return Ok(report);
        }

        if !report.uncommitted.is_empty() && !options.force {
            return Err(Error::UncommittedChanges {
                paths: report.uncommitted.iter().map(PathBuf::from).collect(),
            });
        }

        for rel in &removals {
            let path = entry_path(&target, rel);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Directories the manifest no longer declares, deepest first.
        if let Some(current) = &current {
            let declared_dirs: HashSet<String> =
                manifest.root().dirs().into_iter().map(|(rel, _)| rel).collect();
            let stale: Vec<String> = current
                .dirs()
                .into_iter()
                .map(|(rel, _)| rel)
                .filter(|rel| !declared_dirs.contains(rel))
                .collect();
            for rel in stale.iter().rev() {
                remove_dir_if_empty(&entry_path(&target, rel))?;
            }
        }

        for (rel, _) in manifest.root().dirs() {
            fs::create_dir_all(entry_path(&target, &rel))?;
        }

        let outcomes: Vec<(String, Hash, Result<u64>)> = pool.install(|| {
            writes
                .par_iter()
                .map(|(rel, hash)| {
                    let dest = entry_path(&target, rel);
                    (rel.clone(), *hash, self.store.materialize_file(hash, &dest))
                })
                .collect()
        });

        for (rel, hash, outcome) in outcomes {
            match outcome {
                Ok(_) => {}
                // Collected by a concurrent gc since classification.
                Err(Error::ObjectNotFound { .. }) => {
                    let path = workspace_path(manifest, &rel);
                    warn!(%path, %hash, "cache entry disappeared during checkout");
                    report.added.retain(|p| p != &path);
                    report.modified.retain(|p| p != &path);
                    report.missing.push(MissingFile { path, hash });
                }
                Err(e) => return Err(e),
            }
        }
        report.missing.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            path = manifest.path(),
            added = report.added.len(),
            modified = report.modified.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged.len(),
            missing = report.missing.len(),
            skipped = report.skipped.len(),
            "checkout finished"
        );
        Ok(report)
    }

    /// Check out every pointer file in the workspace.
    pub fn checkout_all(&self, options: CheckoutOptions) -> Result<Vec<CheckoutReport>> {
        self.manifests()?
            .iter()
            .map(|manifest| self.checkout(manifest, options))
            .collect()
    }

    /// Compare the workspace with `manifest` without modifying anything.
    pub fn status(&self, manifest: &Manifest) -> Result<StatusReport> {
        self.check_algorithm(manifest)?;
        let target = self.absolute(manifest.path());
        let pool = worker_pool(self.config.jobs())?;
        let (current, skipped) = pool.install(|| self.current_tree(&target))?;

        let mut changes = match &current {
            Some(node) => diff(manifest.root(), node),
            None => manifest
                .root()
                .files()
                .into_iter()
                .map(|(rel, f)| Change {
                    path: rel,
                    kind: ChangeKind::Removed,
                    old: Some(f.hash),
                    new: None,
                })
                .collect(),
        };
        for change in &mut changes {
            change.path = workspace_path(manifest, &change.path);
        }

        let declared: Vec<Hash> = manifest.root().leaf_hashes().into_iter().collect();
        let cached = self.store.has_many(&declared);
        let missing_objects = declared
            .into_iter()
            .filter(|h| !cached.contains(h))
            .collect();

        let in_sync = skipped.is_empty()
            && current.as_ref().is_some_and(|node| {
                node.hash() == manifest.hash() && node.kind() == manifest.root().kind()
            });

        Ok(StatusReport {
            path: manifest.path().to_string(),
            in_sync,
            changes,
            missing_objects,
            skipped: skipped
                .iter()
                .map(|rel| workspace_path(manifest, rel))
                .collect(),
        })
    }

    /// Every pointer file in the workspace, sorted.
    ///
    /// `.datum/` is skipped and `.datumignore` files are honored.
    pub fn pointer_files(&self) -> Result<Vec<PathBuf>> {
        let walker = ignore::WalkBuilder::new(&self.root)
            .standard_filters(false)
            .add_custom_ignore_filename(IGNORE_FILENAME)
            .filter_entry(|entry| entry.file_name() != DATUM_DIR)
            .build();

        let mut pointers = Vec::new();
        for entry in walker {
            let entry = entry?;
            let is_file = entry.file_type().is_some_and(|t| t.is_file());
            if is_file && entry.path().extension() == Some(OsStr::new(POINTER_EXTENSION)) {
                pointers.push(entry.into_path());
            }
        }
        pointers.sort();
        Ok(pointers)
    }

    /// Decode every pointer file in the workspace.
    pub fn manifests(&self) -> Result<Vec<Manifest>> {
        self.pointer_files()?
            .iter()
            .map(|path| {
                Manifest::load(path).map_err(|e| match e {
                    Error::MalformedManifest { reason } => {
                        Error::malformed_manifest(format!("{}: {}", path.display(), reason))
                    }
                    other => other,
                })
            })
            .collect()
    }

    /// Remove cache entries no manifest in `scope` references.
    ///
    /// The keep set's snapshot starts before any manifest is read, so entries
    /// written by a concurrent add are never collected.
    pub fn gc(&self, scope: GcScope, dry_run: bool) -> Result<GcStats> {
        let mut keep = KeepSet::begin();
        let manifests = match scope {
            GcScope::Workspace => self.manifests()?,
            GcScope::Manifests(manifests) => manifests,
        };
        for manifest in &manifests {
            self.check_algorithm(manifest)?;
            keep.add_manifest(manifest);
        }
        debug!(manifests = manifests.len(), keep = keep.len(), "gc keep set ready");
        self.store.gc(&keep, dry_run)
    }

    /// Open a configured remote, or the default one when `name` is `None`.
    ///
    /// Relative remote paths are resolved against the workspace root.
    pub fn remote(&self, name: Option<&str>) -> Result<LocalRemote> {
        let remote = match name {
            Some(name) => self.config.remote(name)?,
            None => self.config.default_remote()?,
        };
        LocalRemote::new(self.root.join(remote.url))
    }

    /// Upload the content of every pointer file in the workspace.
    pub fn push(&self, remote: Option<&str>) -> Result<TransferReport> {
        let remote = self.remote(remote)?;
        SyncEngine::new(self.config.jobs())?.push(&self.manifests()?, &self.store, &remote)
    }

    /// Download the content of every pointer file in the workspace.
    pub fn pull(&self, remote: Option<&str>) -> Result<TransferReport> {
        let remote = self.remote(remote)?;
        SyncEngine::new(self.config.jobs())?.pull(&self.manifests()?, &remote, &self.store)
    }

    /// Where the content of every pointer file lives.
    pub fn sync_status(&self, remote: Option<&str>) -> Result<SyncStatus> {
        let remote = self.remote(remote)?;
        SyncEngine::new(self.config.jobs())?.status(&self.manifests()?, &self.store, &remote)
    }

    /// Normalize `path` to a workspace-relative, `/`-separated string.
    fn relative(&self, path: &Path) -> Result<String> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        // Resolve the parent only; the tracked path itself is never followed.
        let absolute = match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => parent.canonicalize()?.join(name),
            _ => joined.clone(),
        };

        let rel = absolute.strip_prefix(&self.root).map_err(|_| {
            Error::invalid_entry(format!(
                "{} is outside the workspace {}",
                path.display(),
                self.root.display()
            ))
        })?;

        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(
                    part.to_str()
                        .ok_or_else(|| {
                            Error::invalid_entry(format!("Invalid filename: {}", path.display()))
                        })?
                        .to_string(),
                ),
                _ => {
                    return Err(Error::invalid_entry(format!(
                        "Path must not contain '..': {}",
                        path.display()
                    )));
                }
            }
        }

        match parts.first() {
            None => return Err(Error::invalid_entry("Cannot track the workspace root itself")),
            Some(first) if first == DATUM_DIR => {
                return Err(Error::invalid_entry("Cannot track workspace metadata"));
            }
            _ => {}
        }
        if parts
            .last()
            .is_some_and(|last| Path::new(last).extension() == Some(OsStr::new(POINTER_EXTENSION)))
        {
            return Err(Error::invalid_entry(format!(
                "Pointer files cannot be tracked: {}",
                path.display()
            )));
        }

        Ok(parts.join("/"))
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        entry_path(&self.root, rel)
    }

    /// Hash what is on disk at `target`, with the `/`-separated paths of
    /// entries below it that could not be hashed.
    fn current_tree(&self, target: &Path) -> Result<(Option<Node>, Vec<String>)> {
        match fs::symlink_metadata(target) {
            Ok(_) => {
                let walker = Walker::hashing(self.store.algorithm()).skipping_unhashable();
                let node = walker.walk(target)?;
                let skipped = walker
                    .skipped()
                    .iter()
                    .filter_map(|path| path.strip_prefix(target).ok())
                    .map(|rel| {
                        rel.components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .collect();
                Ok((Some(node), skipped))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((None, Vec::new())),
            Err(e) => Err(Error::unreadable_input(target, e)),
        }
    }

    fn check_algorithm(&self, manifest: &Manifest) -> Result<()> {
        if manifest.algorithm() != self.store.algorithm() {
            return Err(Error::unsupported_algorithm(format!(
                "{} uses {}, cache store uses {}",
                manifest.path(),
                manifest.algorithm(),
                self.store.algorithm()
            )));
        }
        Ok(())
    }
}

/// `base` joined with a `/`-separated relative path (empty means `base`).
fn entry_path(base: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|part| !part.is_empty())
        .fold(base.to_path_buf(), |path, part| path.join(part))
}

/// Workspace-relative path of an entry inside a tracked path.
fn workspace_path(manifest: &Manifest, rel: &str) -> String {
    if rel.is_empty() {
        manifest.path().to_string()
    } else {
        format!("{}/{}", manifest.path(), rel)
    }
}

fn remove_dir_if_empty(path: &Path) -> Result<()> {
    let empty = match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if empty {
        fs::remove_dir(path)?;
        debug!(path = %path.display(), "removed directory");
    }
    Ok(())
}
