//! End-to-end workflows over a real workspace, cache and remote.

use datum_core::{
    Algorithm, CheckoutOptions, Error, GcScope, Hash, LocalRemote, Manifest, Result, SyncEngine,
    Transport, Workspace, hash_path,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

struct Env {
    temp: TempDir,
    ws: Workspace,
}

impl Env {
    fn new(algorithm: Algorithm) -> Self {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::init(temp.path().join("ws"), algorithm).unwrap();
        Self { temp, ws }
    }

    fn write(&self, rel: &str, content: &[u8]) {
        let path = self.ws.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.ws.root().join(rel)).unwrap()
    }

    fn exists(&self, rel: &str) -> bool {
        self.ws.root().join(rel).exists()
    }

    fn remote(&self) -> LocalRemote {
        LocalRemote::new(self.temp.path().join("remote")).unwrap()
    }
}

fn sorted_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn adding_a_file_pushes_only_the_new_object() {
    let env = Env::new(Algorithm::Blake3);
    env.write("data/a.bin", &[b'a'; 10]);
    env.write("data/b.bin", &[b'b'; 20]);

    let v1 = env.ws.add("data").unwrap();
    assert_eq!(v1.file_count(), 2);
    assert_eq!(v1.size(), 30);
    let text = fs::read_to_string(env.ws.root().join("data.datum")).unwrap();
    assert!(text.contains("file_count: 2\n"));
    assert!(text.contains("size: 30\n"));

    let remote = env.remote();
    let engine = SyncEngine::new(4).unwrap();
    let first = engine
        .push(std::slice::from_ref(&v1), env.ws.store(), &remote)
        .unwrap();
    assert_eq!(first.transferred.len(), 2);

    env.write("data/c.bin", &[b'c'; 5]);
    let v2 = env.ws.add("data").unwrap();
    assert_eq!(v2.file_count(), 3);
    assert_eq!(v2.size(), 35);
    assert_ne!(v1.hash(), v2.hash());

    let second = engine
        .push(std::slice::from_ref(&v2), env.ws.store(), &remote)
        .unwrap();
    assert_eq!(second.transferred, vec![Algorithm::Blake3.hash_bytes(&[b'c'; 5])]);
    assert_eq!(second.skipped.len(), 2);
    assert!(second.failed.is_empty());
}

#[test]
fn checking_out_an_older_manifest_removes_newer_files() {
    let env = Env::new(Algorithm::Blake3);
    env.write("data/a.bin", &[b'a'; 10]);
    env.write("data/b.bin", &[b'b'; 20]);
    let v1 = env.ws.add("data").unwrap();

    env.write("data/c.bin", &[b'c'; 5]);
    env.ws.add("data").unwrap();

    let report = env.ws.checkout(&v1, CheckoutOptions::default()).unwrap();
    assert_eq!(report.removed, vec!["data/c.bin"]);
    assert!(report.added.is_empty());
    assert_eq!(report.unchanged, vec!["data/a.bin", "data/b.bin"]);
    assert_eq!(
        sorted_files(&env.ws.root().join("data")),
        vec!["a.bin", "b.bin"]
    );
}

#[test]
fn corrupted_entry_fails_integrity_check() {
    let env = Env::new(Algorithm::Blake3);
    env.write("data/a.bin", b"precious bytes");
    env.ws.add("data").unwrap();

    let hash = Algorithm::Blake3.hash_bytes(b"precious bytes");
    let path = env.ws.store().object_path(&hash);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    assert!(matches!(
        env.ws.store().get_blob(&hash),
        Err(Error::Integrity { .. })
    ));
    assert_eq!(env.ws.store().verify_all().unwrap(), vec![hash]);
}

#[test]
fn gc_keeps_only_the_current_manifest() {
    let env = Env::new(Algorithm::Blake3);
    env.write("data/a.bin", b"shared");
    env.write("data/b.bin", b"first version");
    env.write("data/c.bin", b"dropped later");
    let old = env.ws.add("data").unwrap();

    env.write("data/b.bin", b"second version");
    fs::remove_file(env.ws.root().join("data/c.bin")).unwrap();
    let current = env.ws.add("data").unwrap();

    std::thread::sleep(std::time::Duration::from_millis(50));
    let stats = env
        .ws
        .gc(GcScope::Manifests(vec![current.clone()]), false)
        .unwrap();
    assert_eq!(stats.objects_deleted, 2);

    let store = env.ws.store();
    for hash in current.root().leaf_hashes() {
        assert!(store.has(&hash));
    }
    let only_old: Vec<Hash> = old
        .root()
        .leaf_hashes()
        .difference(&current.root().leaf_hashes())
        .copied()
        .collect();
    assert_eq!(only_old.len(), 2);
    for hash in only_old {
        assert!(!store.has(&hash));
    }
}

#[test]
fn push_delete_pull_checkout_restores_identical_bytes() {
    let env = Env::new(Algorithm::Sha256);
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    env.write("data/big.bin", &big);
    env.write("data/nested/small.txt", b"hello");
    let manifest = env.ws.add("data").unwrap();

    let remote = env.remote();
    let engine = SyncEngine::new(2).unwrap();
    let manifests = std::slice::from_ref(&manifest);
    engine.push(manifests, env.ws.store(), &remote).unwrap();

    for hash in manifest.root().leaf_hashes() {
        fs::remove_file(env.ws.store().object_path(&hash)).unwrap();
    }
    fs::remove_dir_all(env.ws.root().join("data")).unwrap();

    let before = env.ws.checkout(&manifest, CheckoutOptions::default()).unwrap();
    assert_eq!(before.missing.len(), 2);

    let pulled = engine.pull(manifests, &remote, env.ws.store()).unwrap();
    assert_eq!(pulled.transferred.len(), 2);

    let after = env.ws.checkout(&manifest, CheckoutOptions::default()).unwrap();
    assert!(after.missing.is_empty());
    assert_eq!(env.read("data/big.bin"), big);
    assert_eq!(env.read("data/nested/small.txt"), b"hello");
    assert!(env.ws.status(&manifest).unwrap().in_sync);
}

#[test]
fn add_is_idempotent_and_checkout_after_add_is_a_noop() {
    let env = Env::new(Algorithm::Blake3);
    env.write("data/x/1.bin", b"one");
    env.write("data/y/2.bin", b"two");

    env.ws.add("data").unwrap();
    let first = fs::read(env.ws.root().join("data.datum")).unwrap();
    let manifest = env.ws.add("data").unwrap();
    let second = fs::read(env.ws.root().join("data.datum")).unwrap();
    assert_eq!(first, second);

    let report = env.ws.checkout(&manifest, CheckoutOptions::default()).unwrap();
    assert!(report.is_noop());
    assert_eq!(env.read("data/x/1.bin"), b"one");
}

#[test]
fn pointer_text_round_trips() {
    let env = Env::new(Algorithm::Blake3);
    env.write("data/deep/er/file.bin", b"deep");
    env.write("data/top.bin", b"top");
    env.write("data/with space.bin", b"spaced");
    env.ws.add("data").unwrap();

    let text = fs::read_to_string(env.ws.root().join("data.datum")).unwrap();
    let decoded = Manifest::decode(&text).unwrap();
    assert_eq!(decoded.encode(), text);
}

#[test]
fn fingerprints_ignore_creation_order_and_location() {
    let temp = TempDir::new().unwrap();
    let names = ["alpha", "beta", "gamma", "delta"];

    let forward = temp.path().join("one/data");
    fs::create_dir_all(&forward).unwrap();
    for name in names {
        fs::write(forward.join(name), name).unwrap();
    }

    let backward = temp.path().join("two/elsewhere/data");
    fs::create_dir_all(&backward).unwrap();
    for name in names.iter().rev() {
        fs::write(backward.join(name), name).unwrap();
    }

    for algorithm in [Algorithm::Blake3, Algorithm::Sha256] {
        assert_eq!(
            hash_path(&forward, algorithm).unwrap(),
            hash_path(&backward, algorithm).unwrap()
        );
    }
}

#[test]
fn workspace_checkout_all_follows_pointer_files() {
    let env = Env::new(Algorithm::Blake3);
    env.write("images/cat.png", b"meow");
    env.write("models/weights.bin", b"0101");
    env.ws.add("images").unwrap();
    env.ws.add("models/weights.bin").unwrap();

    fs::remove_dir_all(env.ws.root().join("images")).unwrap();
    fs::remove_file(env.ws.root().join("models/weights.bin")).unwrap();

    let reports = env.ws.checkout_all(CheckoutOptions::default()).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(env.exists("images/cat.png"));
    assert_eq!(env.read("models/weights.bin"), b"0101");
}

/// Fails every upload whose key is in `fail`.
struct FlakyRemote {
    inner: LocalRemote,
    fail: HashSet<Hash>,
}

impl Transport for FlakyRemote {
    fn put(&self, key: &Hash, bytes: &[u8]) -> Result<()> {
        if self.fail.contains(key) {
            return Err(Error::transfer(key.to_hex(), "timed out"));
        }
        self.inner.put(key, bytes)
    }

    fn get(&self, key: &Hash) -> Result<Vec<u8>> {
        self.inner.get(key)
    }

    fn exists(&self, key: &Hash) -> Result<bool> {
        self.inner.exists(key)
    }
}

#[test]
fn transport_failures_are_reported_per_object() {
    let env = Env::new(Algorithm::Blake3);
    for i in 0..6u8 {
        env.write(&format!("data/{}.bin", i), &[i; 32]);
    }
    let manifest = env.ws.add("data").unwrap();
    let manifests = std::slice::from_ref(&manifest);

    let failing: HashSet<Hash> = [1u8, 4]
        .iter()
        .map(|i| Algorithm::Blake3.hash_bytes(&[*i; 32]))
        .collect();
    let flaky = FlakyRemote {
        inner: env.remote(),
        fail: failing.clone(),
    };

    let engine = SyncEngine::new(3).unwrap();
    let report = engine.push(manifests, env.ws.store(), &flaky).unwrap();
    assert_eq!(report.transferred.len(), 4);
    let failed: HashSet<Hash> = report.failed.iter().map(|f| f.hash).collect();
    assert_eq!(failed, failing);
    assert!(report.failed.iter().all(|f| f.reason.contains("timed out")));

    // Objects that made it are complete and valid at the remote.
    let remote = env.remote();
    for hash in &report.transferred {
        assert!(remote.exists(hash).unwrap());
    }

    let retry = engine.push(manifests, env.ws.store(), &remote).unwrap();
    assert_eq!(retry.transferred.len(), 2);
    assert_eq!(retry.skipped.len(), 4);
}
