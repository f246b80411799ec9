//! Cache store management and entry I/O.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, CHUNK_SIZE, CancelFlag, Hash, Hasher};
use crate::object::{CompressionType, HEADER_SIZE, ObjectHeader};
use filetime::FileTime;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Compression threshold: content >= 4KB is compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// zstd level used for cache entries.
const ZSTD_LEVEL: i32 = 3;

/// A content-addressed cache of immutable entries keyed by fingerprint.
///
/// The handle is cheap to share across threads; every write lands through
/// an atomic rename, so concurrent writers of the same fingerprint converge
/// on identical bytes without locking.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    algorithm: Algorithm,
}

impl Store {
    /// Initialize a new store at the given path.
    ///
    /// Creates the directory structure:
    /// - `objects/<algo>/` for storing entries
    /// - `tmp/` for in-progress writes
    /// - `config` file with version and algorithm
    pub fn init<P: AsRef<Path>>(root: P, algorithm: Algorithm) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("objects").join(algorithm.as_str()))?;
        fs::create_dir_all(root.join("tmp"))?;

        let config_content = format!("version=1\nalgo={}\n", algorithm.as_str());
        fs::write(root.join("config"), config_content)?;

        debug!(root = %root.display(), algo = %algorithm, "initialized cache store");

        Ok(Self { root, algorithm })
    }

    /// Open an existing store at the given path.
    ///
    /// Validates the store structure and reads the configuration.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config_content = fs::read_to_string(&config_path)?;
        let algorithm = Self::parse_config(&config_content)?;

        let objects_dir = root.join("objects").join(algorithm.as_str());
        if !objects_dir.exists() {
            return Err(Error::invalid_store(
                &root,
                "objects directory structure missing",
            ));
        }

        fs::create_dir_all(root.join("tmp"))?;

        Ok(Self { root, algorithm })
    }

    /// Parse the config file to extract the algorithm.
    fn parse_config(content: &str) -> Result<Algorithm> {
        let mut version = None;
        let mut algo = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_config(format!(
                "Unsupported store config version: {:?}",
                version
            )));
        }

        let algo_str = algo.ok_or_else(|| Error::invalid_config("Missing algo in store config"))?;
        Algorithm::parse(algo_str)
    }

    /// Get the path to an entry given its hash.
    ///
    /// Returns: `objects/{algorithm}/{prefix}/{suffix}`
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        self.objects_dir().join(hash.prefix()).join(hash.suffix())
    }

    /// Directory holding the shard directories.
    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects").join(self.algorithm.as_str())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the algorithm used by this store.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether an entry exists for `hash`.
    pub fn has(&self, hash: &Hash) -> bool {
        self.object_path(hash).is_file()
    }

    /// Batch membership query: the subset of `hashes` present in the store.
    pub fn has_many(&self, hashes: &[Hash]) -> HashSet<Hash> {
        hashes.iter().filter(|h| self.has(h)).copied().collect()
    }

    /// Refresh an existing entry's modification time.
    ///
    /// Garbage collection never removes entries touched after its snapshot,
    /// so a dedup hit during a concurrent collection keeps its entry.
    fn touch(&self, path: &Path) -> Result<()> {
        filetime::set_file_mtime(path, FileTime::now())?;
        Ok(())
    }

    /// Mark an existing entry as recently used.
    pub(crate) fn refresh(&self, hash: &Hash) -> Result<()> {
        self.touch(&self.object_path(hash))
    }

    /// Store content from a reader.
    ///
    /// Returns the hash of the stored content. Idempotent: storing content
    /// that is already present writes nothing.
    pub fn put_blob<R: Read>(&self, reader: R) -> Result<Hash> {
        let (hash, _) = self.put_stream(reader, None)?;
        Ok(hash)
    }

    /// Store a file's content, returning its hash and size.
    pub fn put_file(&self, path: &Path, cancel: Option<&CancelFlag>) -> Result<(Hash, u64)> {
        let file = fs::File::open(path).map_err(|e| Error::unreadable_input(path, e))?;
        self.put_stream(file, cancel)
    }

    /// Stream content into a temporary file, then persist it under its hash.
    ///
    /// Memory use is bounded by the chunk size regardless of content size.
    fn put_stream<R: Read>(&self, mut reader: R, cancel: Option<&CancelFlag>) -> Result<(Hash, u64)> {
        // Peek far enough to decide on compression.
        let mut head = Vec::with_capacity(COMPRESSION_THRESHOLD);
        (&mut reader)
            .take(COMPRESSION_THRESHOLD as u64)
            .read_to_end(&mut head)?;
        let compression = if head.len() >= COMPRESSION_THRESHOLD {
            CompressionType::Zstd
        } else {
            CompressionType::None
        };

        let mut temp = tempfile::NamedTempFile::new_in(self.tmp_dir())?;
        temp.write_all(&[0u8; HEADER_SIZE])?;

        let mut hasher = self.algorithm.hasher();
        let content = (&head[..]).chain(reader);

        let size = match compression {
            CompressionType::None => {
                copy_hashing(content, &mut hasher, temp.as_file_mut(), cancel, Error::from)?
            }
            CompressionType::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(temp.as_file_mut(), ZSTD_LEVEL)
                    .map_err(|e| Error::compression_error(format!("zstd init failed: {}", e)))?;
                let size = copy_hashing(content, &mut hasher, &mut encoder, cancel, Error::from)?;
                encoder
                    .finish()
                    .map_err(|e| Error::compression_error(format!("zstd compression failed: {}", e)))?;
                size
            }
        };

        let hash = hasher.finalize();
        let obj_path = self.object_path(&hash);

        if obj_path.exists() {
            debug!(%hash, "dedup hit");
            self.touch(&obj_path)?;
            return Ok((hash, size));
        }

        let payload_len = temp.as_file().metadata()?.len() - HEADER_SIZE as u64;
        let header = ObjectHeader::new(self.algorithm, compression, payload_len);
        let file = temp.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.flush()?;

        self.persist_entry(temp, &obj_path)?;

        debug!(%hash, size, compression = compression.as_str(), "stored entry");
        Ok((hash, size))
    }

    /// Rename a finished temporary entry into place and stamp it as fresh.
    ///
    /// A rename keeps the temporary file's mtime, which may predate a
    /// garbage collection snapshot begun while the entry was being written.
    pub(crate) fn persist_entry(&self, temp: tempfile::NamedTempFile, obj_path: &Path) -> Result<()> {
        if let Some(parent) = obj_path.parent() {
            fs::create_dir_all(parent)?;
        }
        temp.persist(obj_path)?;
        self.touch(obj_path)
    }

    /// Retrieve content by hash.
    ///
    /// The digest is re-verified; corrupted entries fail with
    /// [`Error::Integrity`] instead of returning wrong bytes.
    pub fn get_blob(&self, hash: &Hash) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.blob_to_writer(hash, &mut out)?;
        Ok(out)
    }

    /// Stream verified content to a writer, returning the number of bytes.
    ///
    /// Bytes reach the writer before verification completes; callers that
    /// must not expose unverified data write into a temporary location and
    /// commit only on `Ok`.
    pub fn blob_to_writer<W: Write>(&self, hash: &Hash, writer: W) -> Result<u64> {
        let obj_path = self.object_path(hash);
        let file = match fs::File::open(&obj_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(hash.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };
        let total_len = file.metadata()?.len();
        self.decode_entry(hash, file, total_len, writer)
    }

    /// Decode and verify one encoded entry, writing its content to `writer`.
    fn decode_entry<R: Read, W: Write>(
        &self,
        hash: &Hash,
        mut reader: R,
        total_len: u64,
        writer: W,
    ) -> Result<u64> {
        let corrupt = |reason: String| Error::integrity(hash.to_hex(), reason);

        let mut header_buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut header_buf)
            .map_err(|e| corrupt(format!("unreadable header: {}", e)))?;
        let header =
            ObjectHeader::decode(&header_buf).map_err(|e| corrupt(format!("bad header: {}", e)))?;

        if header.algorithm != self.algorithm {
            return Err(corrupt(format!(
                "entry uses {}, store uses {}",
                header.algorithm, self.algorithm
            )));
        }

        let expected_len = (HEADER_SIZE as u64).checked_add(header.payload_len);
        if expected_len != Some(total_len) {
            return Err(corrupt(format!(
                "Payload length mismatch: expected {}, got {}",
                header.payload_len,
                total_len.saturating_sub(HEADER_SIZE as u64)
            )));
        }

        let payload = reader.take(header.payload_len);
        let mut hasher = self.algorithm.hasher();
        let read_err = |e: io::Error| corrupt(format!("unreadable payload: {}", e));

        let size = match header.compression {
            CompressionType::None => copy_hashing(payload, &mut hasher, writer, None, read_err)?,
            CompressionType::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(payload).map_err(read_err)?;
                copy_hashing(decoder, &mut hasher, writer, None, read_err)?
            }
        };

        let computed = hasher.finalize();
        if computed != *hash {
            return Err(corrupt(format!(
                "Hash mismatch: expected {}, got {}",
                hash.to_hex(),
                computed.to_hex()
            )));
        }

        Ok(size)
    }

    /// Write verified content to `dest`, replacing any existing file.
    ///
    /// The content is staged next to `dest` and renamed into place only after
    /// its digest checks out, so a failure leaves `dest` untouched.
    pub fn materialize_file(&self, hash: &Hash, dest: &Path) -> Result<u64> {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
        let size = self.blob_to_writer(hash, temp.as_file_mut())?;
        temp.as_file_mut().flush()?;
        set_file_mode(temp.path())?;
        temp.persist(dest)?;

        Ok(size)
    }

    /// Read an entry's encoded bytes verbatim (header and stored payload).
    pub fn read_raw(&self, hash: &Hash) -> Result<Vec<u8>> {
        match fs::read(self.object_path(hash)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::object_not_found(hash.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open an entry for reading its encoded bytes, after verifying it
    /// against `hash`.
    ///
    /// Fails with [`Error::Integrity`] for a corrupted entry, so its bytes
    /// never leave the store. The returned file is positioned at the start.
    pub fn open_verified_raw(&self, hash: &Hash) -> Result<fs::File> {
        let mut file = match fs::File::open(self.object_path(hash)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(hash.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };
        let total_len = file.metadata()?.len();
        self.decode_entry(hash, &mut file, total_len, io::sink())?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Import encoded bytes produced by [`Store::read_raw`] elsewhere.
    ///
    /// Returns `false` when the entry was already present.
    pub fn import_raw(&self, hash: &Hash, bytes: &[u8]) -> Result<bool> {
        self.import_with(hash, |file| {
            file.write_all(bytes)?;
            Ok(())
        })
    }

    /// Import an encoded entry that `fetch` writes into a temporary file.
    ///
    /// The staged entry is fully decoded and verified against `hash` before
    /// it is persisted; nothing is fetched when the entry is already present,
    /// in which case `false` is returned.
    pub fn import_with<F>(&self, hash: &Hash, fetch: F) -> Result<bool>
    where
        F: FnOnce(&mut fs::File) -> Result<()>,
    {
        let obj_path = self.object_path(hash);
        if obj_path.exists() {
            self.touch(&obj_path)?;
            return Ok(false);
        }

        let mut temp = tempfile::NamedTempFile::new_in(self.tmp_dir())?;
        let file = temp.as_file_mut();
        fetch(&mut *file)?;
        file.flush()?;
        let total_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        self.decode_entry(hash, &mut *file, total_len, io::sink())?;

        self.persist_entry(temp, &obj_path)?;

        debug!(%hash, bytes = total_len, "imported entry");
        Ok(true)
    }

    /// List the fingerprints of every entry in the store.
    pub fn list(&self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();
        for (hash, _) in self.entries()? {
            hashes.push(hash);
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Walk all shard directories, yielding `(hash, path)` per entry.
    ///
    /// Files whose names do not form a valid fingerprint are skipped.
    pub(crate) fn entries(&self) -> Result<Vec<(Hash, PathBuf)>> {
        let mut out = Vec::new();
        let objects_dir = self.objects_dir();
        if !objects_dir.exists() {
            return Ok(out);
        }

        for shard_entry in fs::read_dir(&objects_dir)? {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                continue;
            }

            let prefix = shard_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();

            for obj_entry in fs::read_dir(&shard_path)? {
                let obj_path = obj_entry?.path();
                if !obj_path.is_file() {
                    continue;
                }

                let suffix = obj_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if let Ok(hash) = Hash::from_hex(&format!("{}{}", prefix, suffix)) {
                    out.push((hash, obj_path));
                }
            }
        }

        Ok(out)
    }

    /// Re-verify every entry, returning the fingerprints of corrupted ones.
    pub fn verify_all(&self) -> Result<Vec<Hash>> {
        let mut corrupted = Vec::new();
        for hash in self.list()? {
            match self.blob_to_writer(&hash, io::sink()) {
                Ok(_) => {}
                Err(Error::Integrity { reason, .. }) => {
                    debug!(%hash, %reason, "corrupted entry");
                    corrupted.push(hash);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(corrupted)
    }
}

/// Give materialized files regular permissions (temp files start as 0600).
#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Set file mode (Windows no-op).
#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Copy `reader` to `writer` in chunks, feeding every byte to `hasher`.
///
/// Read failures go through `read_err`; write failures become I/O errors.
fn copy_hashing<R: Read, W: Write>(
    mut reader: R,
    hasher: &mut Hasher,
    mut writer: W,
    cancel: Option<&CancelFlag>,
    read_err: impl Fn(io::Error) -> Error,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        if let Some(flag) = cancel {
            flag.check()?;
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_err(e)),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    Ok(total)
}
