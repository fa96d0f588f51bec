//! Content-addressed blob/tree store.
//!
//! Writes are append-only and idempotent: writing the same bytes twice
//! yields the same digest and is a no-op the second time. Objects are laid
//! out on disk the way loose Git objects are — sharded by the first byte of
//! the digest — write the object, *then* make it reachable. A bounded
//! in-memory cache (`lru-mem`) sits in front of disk reads.

pub mod tree;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use lru_mem::LruCache;
use rayon::prelude::*;

use crate::errors::DogmaError;
use crate::hash::ObjectHash;

/// Any persisted object is either a blob's raw bytes or a tree's encoded
/// entry list (see [`tree::Tree`]).
pub trait ObjectStore: Send + Sync {
    /// True if `hash` is already stored.
    fn has(&self, hash: &ObjectHash) -> bool;

    /// Read the bytes stored under `hash`.
    fn read(&self, hash: &ObjectHash) -> Result<Vec<u8>, DogmaError>;

    /// Store `data`, returning its digest. Idempotent.
    fn write(&self, data: &[u8]) -> Result<ObjectHash, DogmaError>;
}

/// Filesystem-backed object store: `<root>/<xx>/<rest-of-38-hex-chars>`.
pub struct FsObjectStore {
    root: PathBuf,
    cache: Mutex<LruCache<ObjectHash, Vec<u8>>>,
}

impl FsObjectStore {
    pub fn open(root: impl Into<PathBuf>, cache_bytes: usize) -> Result<Self, DogmaError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cache: Mutex::new(LruCache::new(cache_bytes)),
        })
    }

    fn path_for(&self, hash: &ObjectHash) -> PathBuf {
        let hex = hash.to_hex();
        let (shard, rest) = hex.split_at(2);
        self.root.join(shard).join(rest)
    }

    /// Same content as [`ObjectStore::read`], as a refcounted `Bytes` rather
    /// than an owned `Vec<u8>` — for a caller (e.g. an HTTP response body)
    /// that wants to clone the buffer across tasks without copying it.
    pub fn read_bytes(&self, hash: &ObjectHash) -> Result<Bytes, DogmaError> {
        self.read(hash).map(Bytes::from)
    }

    /// Re-hashes every object under `root` and reports any digest whose
    /// on-disk path no longer matches its content, in parallel across the
    /// shards. A loose object is immutable once written, so any mismatch
    /// means on-disk corruption, not a concurrent writer.
    pub fn verify_all(&self) -> Result<Vec<ObjectHash>, DogmaError> {
        let shards: Vec<PathBuf> = std::fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();

        let mut paths = Vec::new();
        for shard in shards {
            for entry in std::fs::read_dir(&shard)? {
                paths.push(entry?.path());
            }
        }

        let mismatched: Vec<ObjectHash> = paths
            .par_iter()
            .filter_map(|path| {
                let data = std::fs::read(path).ok()?;
                let shard = path.parent()?.file_name()?.to_str()?;
                let rest = path.file_name()?.to_str()?;
                let claimed: ObjectHash = format!("{shard}{rest}").parse().ok()?;
                let actual = ObjectHash::of(&data);
                (actual != claimed).then_some(claimed)
            })
            .collect();
        Ok(mismatched)
    }
}

impl ObjectStore for FsObjectStore {
    fn has(&self, hash: &ObjectHash) -> bool {
        if self.cache.lock().unwrap().contains(hash) {
            return true;
        }
        self.path_for(hash).is_file()
    }

    fn read(&self, hash: &ObjectHash) -> Result<Vec<u8>, DogmaError> {
        if let Some(hit) = self.cache.lock().unwrap().get(hash) {
            return Ok(hit.clone());
        }
        let path = self.path_for(hash);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DogmaError::EntryNotFound(format!("object {hash}"))
            } else {
                DogmaError::Io(e)
            }
        })?;
        // A too-large object simply doesn't fit the cache; that's fine.
        let _ = self.cache.lock().unwrap().insert(*hash, data.clone());
        Ok(data)
    }

    fn write(&self, data: &[u8]) -> Result<ObjectHash, DogmaError> {
        let hash = ObjectHash::of(data);
        let path = self.path_for(&hash);
        if path.is_file() {
            return Ok(hash);
        }
        ensure_parent(&path)?;
        // write-then-rename keeps a crash from ever exposing a partial object;
        // the uuid suffix keeps two concurrent writers of the same digest from
        // ever renaming over each other's in-flight temp file.
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        let _ = self.cache.lock().unwrap().insert(hash, data.to_vec());
        Ok(hash)
    }
}

/// Canonicalize a JSON value to bytes such that two logically equal values
/// produce byte-identical output. `serde_json`'s default map representation
/// (a `BTreeMap`, since this crate does not enable the `preserve_order`
/// feature) already sorts keys, so canonicalization is just a compact
/// re-serialize.
pub fn canonicalize_json(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("serde_json::Value always serializes")
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path(), 1024 * 1024).unwrap();
        (dir, store)
    }

    #[test]
    fn write_is_idempotent() {
        let (_dir, store) = store();
        let h1 = store.write(b"hello").unwrap();
        let h2 = store.write(b"hello").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.read(&h1).unwrap(), b"hello");
    }

    #[test]
    fn missing_object_is_entry_not_found() {
        let (_dir, store) = store();
        let bogus = ObjectHash::of(b"never written");
        assert!(matches!(store.read(&bogus), Err(DogmaError::EntryNotFound(_))));
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(canonicalize_json(&a), canonicalize_json(&b));
    }

    #[test]
    fn ensure_parent_is_idempotent_helper() {
        let (dir, _store) = store();
        let nested = dir.path().join("a/b/c.bin");
        ensure_parent(&nested).unwrap();
        assert!(nested.parent().unwrap().is_dir());
    }

    #[test]
    fn read_bytes_matches_read() {
        let (_dir, store) = store();
        let hash = store.write(b"hello").unwrap();
        assert_eq!(store.read_bytes(&hash).unwrap(), bytes::Bytes::from_static(b"hello"));
    }

    #[test]
    fn verify_all_reports_no_mismatches_for_untampered_objects() {
        let (_dir, store) = store();
        store.write(b"one").unwrap();
        store.write(b"two").unwrap();
        assert!(store.verify_all().unwrap().is_empty());
    }

    #[test]
    fn verify_all_flags_a_tampered_object() {
        let (dir, store) = store();
        let hash = store.write(b"original").unwrap();
        std::fs::write(store.path_for(&hash), b"tampered").unwrap();
        let mismatched = store.verify_all().unwrap();
        assert_eq!(mismatched, vec![hash]);
        drop(dir);
    }
}
