//! # Datum Core
//!
//! A content-addressed data versioning engine.
//!
//! Large files and directories are stored in a local cache keyed by the
//! fingerprint of their content, while small text pointer files (meant to
//! be committed to source control) record which content a workspace path
//! should hold. Checkout reconciles the workspace with any pointer file;
//! push and pull move only the content a remote or the cache is missing.
//!
//! ## Features
//!
//! - Deterministic fingerprints for files and directory trees (BLAKE3 or SHA-256)
//! - Deduplicating, self-verifying cache store with streaming writes
//! - Diff-friendly pointer manifests with a lossless text codec
//! - Checkout with dry-run preview and protection for uncached edits
//! - Delta push/pull over a pluggable transport, with per-object failures
//! - Garbage collection that is safe against concurrent adds
//!
//! ## Example
//!
//! ```no_run
//! use datum_core::{Algorithm, CheckoutOptions, GcScope, Workspace};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ws = Workspace::init("./project", Algorithm::Blake3)?;
//! ws.update_config(|config| config.add_remote("origin", "/mnt/shared/datum"))?;
//!
//! // Track a directory: writes ./project/data.datum
//! let manifest = ws.add("data")?;
//! println!("{} files, {} bytes", manifest.file_count(), manifest.size());
//!
//! // Share its content, then restore it elsewhere
//! let report = ws.push(None)?;
//! println!("uploaded {} objects", report.transferred.len());
//! ws.checkout(&manifest, CheckoutOptions::default())?;
//!
//! // Drop cache entries no pointer file references
//! ws.gc(GcScope::Workspace, false)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod gc;
mod hash;
mod manifest;
mod object;
mod remote;
mod store;
mod sync;
mod tree;
mod walk;
mod workspace;

pub use config::{Config, RemoteConfig};
pub use error::{Error, Result};
pub use gc::{GcStats, KeepSet};
pub use hash::{Algorithm, CancelFlag, HASH_SIZE, Hash};
pub use manifest::{Manifest, POINTER_EXTENSION, pointer_path};
pub use object::{CompressionType, ObjectHeader};
pub use remote::{LocalRemote, Transport};
pub use store::Store;
pub use sync::{SyncEngine, SyncStatus, TransferFailure, TransferReport};
pub use tree::{Change, ChangeKind, DirEntry, EntryKind, FileEntry, Node, diff};
pub use walk::{AddStats, IGNORE_FILENAME, Walker, hash_path};
pub use workspace::{
    CheckoutOptions, CheckoutReport, DATUM_DIR, GcScope, MissingFile, StatusReport, Workspace,
};
