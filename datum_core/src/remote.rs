//! Remote object stores.
//!
//! A remote holds copies of cache entries under the same fingerprint keys.
//! Entries travel in their encoded form (header plus stored payload), so a
//! compressed entry stays compressed on the wire and at rest.

use crate::error::{Error, Result};
use crate::hash::Hash;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Uniform capability the sync engine needs from a remote.
///
/// Implementations are shared across worker threads. Any per-object timeout
/// belongs here: a call that gives up should fail with [`Error::Transfer`]
/// for that key only.
pub trait Transport: Send + Sync {
    /// Store an encoded entry under `key`. Storing an existing key is a no-op.
    fn put(&self, key: &Hash, bytes: &[u8]) -> Result<()>;

    /// Fetch the encoded entry stored under `key`.
    ///
    /// Fails with [`Error::ObjectNotFound`] when the key is absent.
    fn get(&self, key: &Hash) -> Result<Vec<u8>>;

    fn exists(&self, key: &Hash) -> Result<bool>;

    /// Store an encoded entry streamed from `reader`.
    ///
    /// The default buffers the whole entry and calls [`Transport::put`];
    /// transports that can stream should override it.
    fn put_from(&self, key: &Hash, reader: &mut dyn Read) -> Result<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.put(key, &bytes)
    }

    /// Stream the encoded entry stored under `key` into `writer`, returning
    /// the number of bytes written.
    ///
    /// The default buffers the whole entry through [`Transport::get`].
    fn get_into(&self, key: &Hash, writer: &mut dyn Write) -> Result<u64> {
        let bytes = self.get(key)?;
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Batch membership query: the subset of `keys` present at the remote.
    fn exists_many(&self, keys: &[Hash]) -> Result<HashSet<Hash>> {
        let mut present = HashSet::new();
        for key in keys {
            if self.exists(key)? {
                present.insert(*key);
            }
        }
        Ok(present)
    }
}

/// A remote in a local (or mounted) directory, laid out as
/// `<root>/<2-hex prefix>/<62-hex suffix>`.
#[derive(Debug, Clone)]
pub struct LocalRemote {
    root: PathBuf,
}

impl LocalRemote {
    /// Open a remote directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(Error::invalid_remote(format!(
                "not a directory: {}",
                root.display()
            )));
        }
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the object stored under `key`.
    pub fn object_path(&self, key: &Hash) -> PathBuf {
        self.root.join(key.prefix()).join(key.suffix())
    }

    /// Every key present at the remote, sorted.
    pub fn list(&self) -> Result<Vec<Hash>> {
        let mut keys = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(shard.path())? {
                let suffix = entry?.file_name().to_string_lossy().into_owned();
                if let Ok(key) = Hash::from_hex(&format!("{}{}", prefix, suffix)) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl Transport for LocalRemote {
    fn put(&self, key: &Hash, mut bytes: &[u8]) -> Result<()> {
        self.put_from(key, &mut bytes)
    }

    fn get(&self, key: &Hash) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.get_into(key, &mut bytes)?;
        Ok(bytes)
    }

    fn exists(&self, key: &Hash) -> Result<bool> {
        Ok(self.object_path(key).is_file())
    }

    fn put_from(&self, key: &Hash, reader: &mut dyn Read) -> Result<()> {
        let path = self.object_path(key);
        if path.is_file() {
            return Ok(());
        }

        let shard = self.root.join(key.prefix());
        fs::create_dir_all(&shard).map_err(|e| Error::transfer(key.to_hex(), e.to_string()))?;

        // Written under a temporary name in the shard, so a reader never sees
        // a partial object at its final key.
        let mut temp = tempfile::NamedTempFile::new_in(&shard)
            .map_err(|e| Error::transfer(key.to_hex(), e.to_string()))?;
        let bytes = io::copy(reader, temp.as_file_mut())
            .and_then(|n| temp.as_file().sync_all().map(|_| n))
            .map_err(|e| Error::transfer(key.to_hex(), e.to_string()))?;
        temp.persist(&path)
            .map_err(|e| Error::transfer(key.to_hex(), e.error.to_string()))?;

        debug!(%key, bytes, "uploaded object");
        Ok(())
    }

    fn get_into(&self, key: &Hash, writer: &mut dyn Write) -> Result<u64> {
        let mut file = match fs::File::open(self.object_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(key.to_hex()));
            }
            Err(e) => return Err(Error::transfer(key.to_hex(), e.to_string())),
        };
        io::copy(&mut file, writer).map_err(|e| Error::transfer(key.to_hex(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_exists() {
        let temp_dir = TempDir::new().unwrap();
        let remote = LocalRemote::new(temp_dir.path().join("remote")).unwrap();
        let key = Algorithm::Blake3.hash_bytes(b"object");

        assert!(!remote.exists(&key).unwrap());
        remote.put(&key, b"encoded bytes").unwrap();
        assert!(remote.exists(&key).unwrap());
        assert_eq!(remote.get(&key).unwrap(), b"encoded bytes");

        let path = remote.object_path(&key);
        assert_eq!(
            path.strip_prefix(remote.root()).unwrap(),
            Path::new(&key.prefix()).join(key.suffix())
        );
    }

    #[test]
    fn test_get_missing() {
        let temp_dir = TempDir::new().unwrap();
        let remote = LocalRemote::new(temp_dir.path()).unwrap();
        let key = Algorithm::Blake3.hash_bytes(b"absent");

        let err = remote.get(&key).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_put_existing_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let remote = LocalRemote::new(temp_dir.path()).unwrap();
        let key = Algorithm::Blake3.hash_bytes(b"object");

        remote.put(&key, b"first").unwrap();
        remote.put(&key, b"second").unwrap();
        assert_eq!(remote.get(&key).unwrap(), b"first");
    }

    #[test]
    fn test_exists_many_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let remote = LocalRemote::new(temp_dir.path()).unwrap();

        let keys: Vec<Hash> = (0..5u8)
            .map(|i| Algorithm::Blake3.hash_bytes(&[i]))
            .collect();
        for key in &keys[..3] {
            remote.put(key, b"x").unwrap();
        }

        let present = remote.exists_many(&keys).unwrap();
        assert_eq!(present.len(), 3);
        assert!(keys[..3].iter().all(|k| present.contains(k)));

        let mut expected = keys[..3].to_vec();
        expected.sort();
        assert_eq!(remote.list().unwrap(), expected);
    }

    #[test]
    fn test_streaming_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let remote = LocalRemote::new(temp_dir.path()).unwrap();
        let key = Algorithm::Blake3.hash_bytes(b"streamed");
        let body = vec![7u8; 300_000];

        remote.put_from(&key, &mut &body[..]).unwrap();
        let mut out = Vec::new();
        assert_eq!(remote.get_into(&key, &mut out).unwrap(), body.len() as u64);
        assert_eq!(out, body);

        let absent = Algorithm::Blake3.hash_bytes(b"absent");
        assert!(matches!(
            remote.get_into(&absent, &mut Vec::new()),
            Err(Error::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn test_rejects_file_as_root() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            LocalRemote::new(&file),
            Err(Error::InvalidRemote { .. })
        ));
    }
}
