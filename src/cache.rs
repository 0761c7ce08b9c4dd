//! Content-addressed cache for structured records and embedding vectors.
//!
//! Entries live under `<data_dir>/projects/<project dir>/cache/` and are named by
//! the hex SHA-256 of their key parts, so a changed input always produces a
//! new file rather than overwriting an old one. Records are JSON
//! (`<key>.json`); vectors are flat little-endian `f32` arrays (`<key>.f32`).
//!
//! The cache only ever affects speed. Every I/O or decode failure is logged
//! and reported as a miss.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::project_dir_name;

/// Which artifact family a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Record,
    Vector,
}

impl CacheKind {
    fn extension(&self) -> &'static str {
        match self {
            CacheKind::Record => "json",
            CacheKind::Vector => "f32",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(data_dir: &Path, project: &str) -> Self {
        Self {
            root: data_dir
                .join("projects")
                .join(project_dir_name(project))
                .join("cache"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic, order-sensitive key over `parts`.
    ///
    /// Each part is length-prefixed before hashing so that `["ab", "c"]` and
    /// `["a", "bc"]` never collide.
    pub fn key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn exists(&self, key: &str, kind: CacheKind) -> bool {
        self.path_for(key, kind).is_file()
    }

    pub fn put_record<T: Serialize>(&self, key: &str, record: &T) {
        match serde_json::to_vec(record) {
            Ok(bytes) => self.write(key, CacheKind::Record, &bytes),
            Err(e) => tracing::warn!(key, error = %e, "cache: failed to encode record"),
        }
    }

    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.read(key, CacheKind::Record)?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache: unreadable record, treating as miss");
                None
            }
        }
    }

    pub fn put_vector(&self, key: &str, vector: &[f32]) {
        self.write(key, CacheKind::Vector, &vec_to_blob(vector));
    }

    pub fn get_vector(&self, key: &str) -> Option<Vec<f32>> {
        let bytes = self.read(key, CacheKind::Vector)?;
        if bytes.len() % 4 != 0 {
            tracing::warn!(key, len = bytes.len(), "cache: truncated vector, treating as miss");
            return None;
        }
        Some(blob_to_vec(&bytes))
    }

    fn path_for(&self, key: &str, kind: CacheKind) -> PathBuf {
        self.root.join(format!("{}.{}", key, kind.extension()))
    }

    fn read(&self, key: &str, kind: CacheKind) -> Option<Vec<u8>> {
        let path = self.path_for(key, kind);
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache: read failed");
                None
            }
        }
    }

    fn write(&self, key: &str, kind: CacheKind, bytes: &[u8]) {
        let path = self.path_for(key, kind);
        if let Err(e) = write_atomic(&path, bytes) {
            tracing::warn!(path = %path.display(), error = %e, "cache: write failed");
        }
    }
}

/// Write `bytes` to a temporary sibling of `path`, then rename into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Plan {
        tasks: Vec<String>,
    }

    #[test]
    fn test_key_deterministic_and_order_sensitive() {
        let k = ContentCache::key(&["a", "b", "c"]);
        assert_eq!(k, ContentCache::key(&["a", "b", "c"]));
        assert_eq!(k.len(), 64);
        assert_ne!(k, ContentCache::key(&["c", "b", "a"]));
        assert_ne!(k, ContentCache::key(&["a", "b", "d"]));
        assert_ne!(ContentCache::key(&["ab", "c"]), ContentCache::key(&["a", "bc"]));
    }

    #[test]
    fn test_record_roundtrip_and_exists() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(tmp.path(), "acme");
        let key = ContentCache::key(&["plan", "C001"]);

        assert!(!cache.exists(&key, CacheKind::Record));
        assert_eq!(cache.get_record::<Plan>(&key), None);

        let plan = Plan {
            tasks: vec!["check rotation".into()],
        };
        cache.put_record(&key, &plan);
        assert!(cache.exists(&key, CacheKind::Record));
        assert!(!cache.exists(&key, CacheKind::Vector));
        assert_eq!(cache.get_record::<Plan>(&key), Some(plan));
    }

    #[test]
    fn test_vector_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(tmp.path(), "acme");
        let key = ContentCache::key(&["chunk", "0"]);
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        cache.put_vector(&key, &v);
        assert_eq!(cache.get_vector(&key), Some(v));
    }

    #[test]
    fn test_projects_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let a = ContentCache::new(tmp.path(), "alpha");
        let b = ContentCache::new(tmp.path(), "beta");
        let key = ContentCache::key(&["same"]);
        a.put_record(&key, &1u32);
        assert_eq!(a.get_record::<u32>(&key), Some(1));
        assert_eq!(b.get_record::<u32>(&key), None);
    }

    #[test]
    fn test_names_that_sanitize_alike_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let a = ContentCache::new(tmp.path(), "acme iso");
        let b = ContentCache::new(tmp.path(), "acme_iso");
        assert_ne!(a.root(), b.root());
        let key = ContentCache::key(&["same"]);
        a.put_record(&key, &1u32);
        assert_eq!(b.get_record::<u32>(&key), None);
    }

    #[test]
    fn test_corrupt_record_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(tmp.path(), "acme");
        let key = ContentCache::key(&["broken"]);
        std::fs::create_dir_all(cache.root()).unwrap();
        std::fs::write(cache.root().join(format!("{}.json", key)), b"{not json").unwrap();
        assert_eq!(cache.get_record::<Plan>(&key), None);
    }

    #[test]
    fn test_unwritable_root_degrades_to_miss() {
        let tmp = TempDir::new().unwrap();
        // A file where the projects directory should be makes every write fail.
        std::fs::write(tmp.path().join("projects"), b"").unwrap();
        let cache = ContentCache::new(tmp.path(), "acme");
        let key = ContentCache::key(&["x"]);
        cache.put_record(&key, &42u32);
        assert_eq!(cache.get_record::<u32>(&key), None);
    }
}
