//! Pointer manifests and their text codec.
//!
//! A manifest records which content a tracked workspace path should hold.
//! It is written next to the tracked path as `<path>.datum` and is meant to
//! be committed to source control, so the format is line-oriented with a
//! fixed key order:
//!
//! ```text
//! hash_algorithm: blake3-256
//! fingerprint: <hex>
//! size: <bytes>
//! file_count: <n>
//! path: <workspace-relative path>
//! dir: <hex> <relative dir path>
//! file: <hex> <size> <relative file path>
//! ```
//!
//! `dir:` and `file:` lines enumerate a directory depth-first in name order.
//! A manifest without entries describes a single file when `file_count` is 1
//! and an empty directory when it is 0.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash};
use crate::tree::{DirEntry, FileEntry, Node, validate_name};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Extension appended to a tracked path to name its pointer file.
pub const POINTER_EXTENSION: &str = "datum";

/// The pointer file for a tracked path: `data` becomes `data.datum`.
pub fn pointer_path(tracked: &Path) -> PathBuf {
    let mut name = tracked.as_os_str().to_os_string();
    name.push(".");
    name.push(POINTER_EXTENSION);
    PathBuf::from(name)
}

/// The declared state of one tracked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    path: String,
    algorithm: Algorithm,
    root: Node,
}

impl Manifest {
    /// Create a manifest for a workspace-relative, `/`-separated path.
    pub fn new(path: impl Into<String>, algorithm: Algorithm, root: Node) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self {
            path,
            algorithm,
            root,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The declared content tree.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Fingerprint of the tracked path.
    pub fn hash(&self) -> Hash {
        self.root.hash()
    }

    pub fn size(&self) -> u64 {
        self.root.size()
    }

    pub fn file_count(&self) -> u64 {
        self.root.file_count()
    }

    /// Render the manifest as pointer-file text.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "hash_algorithm: {}", self.algorithm);
        let _ = writeln!(out, "fingerprint: {}", self.root.hash());
        let _ = writeln!(out, "size: {}", self.root.size());
        let _ = writeln!(out, "file_count: {}", self.root.file_count());
        let _ = writeln!(out, "path: {}", self.path);
        if let Node::Dir(dir) = &self.root {
            encode_children(dir, "", &mut out);
        }
        out
    }

    /// Parse pointer-file text.
    ///
    /// Every directory fingerprint and both totals are recomputed from the
    /// listed files; any disagreement with the declared values is rejected.
    pub fn decode(text: &str) -> Result<Self> {
        let mut algorithm = None;
        let mut fingerprint = None;
        let mut size = None;
        let mut file_count = None;
        let mut path = None;
        let mut root: BTreeMap<String, Pending> = BTreeMap::new();
        let mut has_entries = false;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::malformed_manifest(format!("line {}: expected `key: value`", line_no))
            })?;
            let value = value.strip_prefix(' ').unwrap_or(value);

            match key {
                "hash_algorithm" => {
                    let parsed = Algorithm::parse(value.trim()).map_err(|_| {
                        Error::malformed_manifest(format!(
                            "unknown hash algorithm: {}",
                            value.trim()
                        ))
                    })?;
                    set_once(&mut algorithm, parsed, key)?;
                }
                "fingerprint" => {
                    let parsed = parse_hash(value.trim(), line_no)?;
                    set_once(&mut fingerprint, parsed, key)?;
                }
                "size" => set_once(&mut size, parse_u64(value.trim(), line_no)?, key)?,
                "file_count" => {
                    set_once(&mut file_count, parse_u64(value.trim(), line_no)?, key)?
                }
                "path" => {
                    validate_path(value)?;
                    set_once(&mut path, value.to_string(), key)?;
                }
                "dir" => {
                    let (hex, rel) = value.split_once(' ').ok_or_else(|| {
                        Error::malformed_manifest(format!(
                            "line {}: expected `dir: <hash> <path>`",
                            line_no
                        ))
                    })?;
                    let declared = parse_hash(hex, line_no)?;
                    insert_entry(
                        &mut root,
                        rel,
                        Pending::Dir {
                            declared,
                            children: BTreeMap::new(),
                        },
                    )?;
                    has_entries = true;
                }
                "file" => {
                    let mut parts = value.splitn(3, ' ');
                    let (Some(hex), Some(len), Some(rel)) = (parts.next(), parts.next(), parts.next())
                    else {
                        return Err(Error::malformed_manifest(format!(
                            "line {}: expected `file: <hash> <size> <path>`",
                            line_no
                        )));
                    };
                    let entry = FileEntry {
                        hash: parse_hash(hex, line_no)?,
                        size: parse_u64(len, line_no)?,
                    };
                    insert_entry(&mut root, rel, Pending::File(entry))?;
                    has_entries = true;
                }
                // Fields added by later versions.
                _ => {}
            }
        }

        let algorithm = algorithm.ok_or_else(|| missing("hash_algorithm"))?;
        let fingerprint = fingerprint.ok_or_else(|| missing("fingerprint"))?;
        let size = size.ok_or_else(|| missing("size"))?;
        let file_count = file_count.ok_or_else(|| missing("file_count"))?;
        let path = path.ok_or_else(|| missing("path"))?;

        let node = if !has_entries && file_count == 1 {
            Node::file(fingerprint, size)
        } else {
            let node = build_dir(algorithm, "", root)?;
            if node.hash() != fingerprint {
                return Err(Error::malformed_manifest(format!(
                    "fingerprint {} does not match listed entries ({})",
                    fingerprint,
                    node.hash()
                )));
            }
            node
        };

        if node.size() != size || node.file_count() != file_count {
            return Err(Error::malformed_manifest(format!(
                "declared totals (size {}, file_count {}) do not match entries (size {}, file_count {})",
                size,
                file_count,
                node.size(),
                node.file_count()
            )));
        }

        Ok(Self {
            path,
            algorithm,
            root: node,
        })
    }

    /// Read and decode a pointer file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::decode(&text)
    }

    /// Encode and atomically write a pointer file.
    ///
    /// An existing file with identical text is left untouched.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.encode();
        if let Ok(existing) = fs::read_to_string(path)
            && existing == text
        {
            return Ok(());
        }

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(text.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path)?;
        Ok(())
    }
}

/// An entry parsed from a `dir:` or `file:` line, before verification.
enum Pending {
    File(FileEntry),
    Dir {
        declared: Hash,
        children: BTreeMap<String, Pending>,
    },
}

fn encode_children(dir: &DirEntry, prefix: &str, out: &mut String) {
    for (name, child) in dir.children() {
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        match child {
            Node::File(f) => {
                let _ = writeln!(out, "file: {} {} {}", f.hash, f.size, rel);
            }
            Node::Dir(d) => {
                let _ = writeln!(out, "dir: {} {}", d.hash(), rel);
                encode_children(d, &rel, out);
            }
        }
    }
}

fn insert_entry(root: &mut BTreeMap<String, Pending>, rel: &str, entry: Pending) -> Result<()> {
    let components: Vec<&str> = rel.split('/').collect();
    for component in &components {
        validate_name(component).map_err(|e| {
            Error::malformed_manifest(format!("invalid entry path {:?}: {}", rel, e))
        })?;
    }

    let (last, parents) = components
        .split_last()
        .ok_or_else(|| Error::malformed_manifest("empty entry path"))?;

    let mut current = root;
    for parent in parents {
        current = match current.get_mut(*parent) {
            Some(Pending::Dir { children, .. }) => children,
            _ => {
                return Err(Error::malformed_manifest(format!(
                    "entry {:?} listed before its parent directory",
                    rel
                )));
            }
        };
    }

    if current.contains_key(*last) {
        return Err(Error::malformed_manifest(format!(
            "duplicate entry: {}",
            rel
        )));
    }
    current.insert(last.to_string(), entry);
    Ok(())
}

fn build_dir(algorithm: Algorithm, rel: &str, pending: BTreeMap<String, Pending>) -> Result<Node> {
    let mut children = BTreeMap::new();
    for (name, entry) in pending {
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", rel, name)
        };
        let node = match entry {
            Pending::File(f) => Node::File(f),
            Pending::Dir { declared, children } => {
                let node = build_dir(algorithm, &child_rel, children)?;
                if node.hash() != declared {
                    return Err(Error::malformed_manifest(format!(
                        "directory {} declares {} but its entries hash to {}",
                        child_rel,
                        declared,
                        node.hash()
                    )));
                }
                node
            }
        };
        children.insert(name, node);
    }

    let dir = DirEntry::new(algorithm, children)
        .map_err(|e| Error::malformed_manifest(e.to_string()))?;
    Ok(Node::Dir(dir))
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::malformed_manifest("path cannot be empty"));
    }
    if path.starts_with('/') || path.contains(['\n', '\r']) {
        return Err(Error::malformed_manifest(format!(
            "path must be workspace-relative: {:?}",
            path
        )));
    }
    if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(Error::malformed_manifest(format!(
            "path must be normalized: {:?}",
            path
        )));
    }
    Ok(())
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::malformed_manifest(format!("duplicate field: {}", key)));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_hash(hex: &str, line_no: usize) -> Result<Hash> {
    Hash::from_hex(hex)
        .map_err(|e| Error::malformed_manifest(format!("line {}: {}", line_no, e)))
}

fn parse_u64(value: &str, line_no: usize) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::malformed_manifest(format!("line {}: invalid integer: {:?}", line_no, value))
    })
}

fn missing(field: &str) -> Error {
    Error::malformed_manifest(format!("missing required field: {}", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(algorithm: Algorithm) -> Node {
        let mut sub = BTreeMap::new();
        sub.insert(
            "deep.bin".to_string(),
            Node::file(algorithm.hash_bytes(b"deep"), 4),
        );

        let mut children = BTreeMap::new();
        children.insert(
            "a.bin".to_string(),
            Node::file(algorithm.hash_bytes(b"aaaaaaaaaa"), 10),
        );
        children.insert(
            "sub".to_string(),
            Node::Dir(DirEntry::new(algorithm, sub).unwrap()),
        );
        Node::Dir(DirEntry::new(algorithm, children).unwrap())
    }

    #[test]
    fn test_encode_layout() {
        let root = sample_tree(Algorithm::Blake3);
        let manifest = Manifest::new("data", Algorithm::Blake3, root.clone()).unwrap();
        let text = manifest.encode();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "hash_algorithm: blake3-256");
        assert_eq!(lines[1], format!("fingerprint: {}", root.hash()));
        assert_eq!(lines[2], "size: 14");
        assert_eq!(lines[3], "file_count: 2");
        assert_eq!(lines[4], "path: data");
        assert!(lines[5].starts_with("file: ") && lines[5].ends_with(" 10 a.bin"));
        assert!(lines[6].starts_with("dir: ") && lines[6].ends_with(" sub"));
        assert!(lines[7].starts_with("file: ") && lines[7].ends_with(" 4 sub/deep.bin"));
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn test_roundtrip_directory() {
        let manifest =
            Manifest::new("datasets/raw", Algorithm::Sha256, sample_tree(Algorithm::Sha256))
                .unwrap();
        let text = manifest.encode();
        let decoded = Manifest::decode(&text).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.encode(), text);
    }

    #[test]
    fn test_roundtrip_single_file() {
        let hash = Algorithm::Blake3.hash_bytes(b"model weights");
        let manifest = Manifest::new("model.bin", Algorithm::Blake3, Node::file(hash, 13)).unwrap();
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
        assert!(!decoded.root().is_dir());
    }

    #[test]
    fn test_roundtrip_empty_file_and_empty_dir() {
        let empty_file = Manifest::new(
            "empty",
            Algorithm::Blake3,
            Node::file(Algorithm::Blake3.hash_bytes(b""), 0),
        )
        .unwrap();
        let empty_dir = Manifest::new(
            "empty",
            Algorithm::Blake3,
            Node::Dir(DirEntry::new(Algorithm::Blake3, BTreeMap::new()).unwrap()),
        )
        .unwrap();

        assert_eq!(Manifest::decode(&empty_file.encode()).unwrap(), empty_file);
        assert_eq!(Manifest::decode(&empty_dir.encode()).unwrap(), empty_dir);
    }

    #[test]
    fn test_decode_ignores_comments_and_unknown_fields() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text = format!(
            "# tracked by datum\n\n{}remote_hint: s3://bucket\n",
            manifest.encode()
        );
        assert_eq!(Manifest::decode(&text).unwrap(), manifest);
    }

    #[test]
    fn test_decode_accepts_crlf() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text = manifest.encode().replace('\n', "\r\n");
        assert_eq!(Manifest::decode(&text).unwrap(), manifest);
    }

    #[test]
    fn test_decode_missing_field() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text: String = manifest
            .encode()
            .lines()
            .filter(|l| !l.starts_with("size:"))
            .map(|l| format!("{}\n", l))
            .collect();

        let err = Manifest::decode(&text).unwrap_err();
        assert!(matches!(err, Error::MalformedManifest { .. }));
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn test_decode_unknown_algorithm() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text = manifest
            .encode()
            .replace("hash_algorithm: blake3-256", "hash_algorithm: md5");
        assert!(matches!(
            Manifest::decode(&text),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_tampered_entry() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text = manifest.encode().replace(" 10 a.bin", " 11 a.bin");
        assert!(matches!(
            Manifest::decode(&text),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text = manifest.encode().replace("size: 14", "size: 15");
        assert!(matches!(
            Manifest::decode(&text),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_orphan_entry() {
        let tree = sample_tree(Algorithm::Blake3);
        let manifest = Manifest::new("data", Algorithm::Blake3, tree).unwrap();
        let text: String = manifest
            .encode()
            .lines()
            .filter(|l| !l.starts_with("dir:"))
            .map(|l| format!("{}\n", l))
            .collect();
        assert!(matches!(
            Manifest::decode(&text),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_overflowing_sizes() {
        let x = Algorithm::Blake3.hash_bytes(b"x");
        let y = Algorithm::Blake3.hash_bytes(b"y");
        let text = format!(
            "hash_algorithm: blake3-256\n\
             fingerprint: {}\n\
             size: 0\n\
             file_count: 2\n\
             path: data\n\
             file: {} {} x\n\
             file: {} {} y\n",
            x,
            x,
            u64::MAX,
            y,
            u64::MAX
        );
        assert!(matches!(
            Manifest::decode(&text),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Manifest::decode("this is not a manifest"),
            Err(Error::MalformedManifest { .. })
        ));
        assert!(matches!(
            Manifest::decode(""),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_escaping_path() {
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();
        let text = manifest.encode().replace("path: data", "path: ../data");
        assert!(Manifest::decode(&text).is_err());
        assert!(Manifest::new("/abs", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).is_err());
    }

    #[test]
    fn test_pointer_path() {
        assert_eq!(
            pointer_path(Path::new("ws/data")),
            PathBuf::from("ws/data.datum")
        );
        assert_eq!(
            pointer_path(Path::new("model.bin")),
            PathBuf::from("model.bin.datum")
        );
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("data.datum");
        let manifest =
            Manifest::new("data", Algorithm::Blake3, sample_tree(Algorithm::Blake3)).unwrap();

        manifest.save(&file).unwrap();
        assert_eq!(Manifest::load(&file).unwrap(), manifest);
        assert_eq!(fs::read_to_string(&file).unwrap(), manifest.encode());

        // Saving identical content again is a no-op.
        manifest.save(&file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), manifest.encode());
    }

    // Property-based tests
    use proptest::prelude::*;

    fn arb_tree(algorithm: Algorithm) -> impl Strategy<Value = Node> {
        let leaf = (any::<Vec<u8>>(), 0u64..1_000_000)
            .prop_map(move |(content, size)| Node::file(algorithm.hash_bytes(&content), size));
        leaf.prop_recursive(3, 32, 5, move |inner| {
            prop::collection::btree_map("[a-z0-9_. -]{1,12}", inner, 0..5).prop_filter_map(
                "names must be valid",
                move |children| DirEntry::new(algorithm, children).ok().map(Node::Dir),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        #[test]
        fn prop_codec_roundtrip(tree in arb_tree(Algorithm::Blake3), path in "[a-z]{1,8}(/[a-z]{1,8}){0,2}") {
            let manifest = Manifest::new(path, Algorithm::Blake3, tree).unwrap();
            let text = manifest.encode();
            let decoded = Manifest::decode(&text)?;
            prop_assert_eq!(decoded.encode(), text);
            prop_assert_eq!(decoded, manifest);
        }
    }
}
