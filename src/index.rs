//! Exact nearest-neighbor index with a persisted internal-id map.
//!
//! One index exists per `(doc_type, model)` pair, stored as two files under
//! `<project>/indexes/`:
//!
//! - `<name>.idx`: `RGIX` magic, `u32` version, `u32` dimension, `u64`
//!   count, the SHA-256 of the id map file, then `count * dimension`
//!   little-endian `f32`s;
//! - `<name>.map.json`: JSON array of chunk ids in internal-id order.
//!
//! The two files are renamed into place one after the other, so the vector
//! file carries the digest of the id map it was written with and a load
//! refuses any other map. On load, any mismatch against the supplied chunks
//! (dimension, count, or id set) causes a full rebuild; a stale index is
//! never patched in place.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::cache::{blob_to_vec, vec_to_blob, write_atomic};
use crate::config::sanitize_component;
use crate::models::EmbeddingChunk;

const MAGIC: &[u8; 4] = b"RGIX";
const VERSION: u32 = 2;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + DIGEST_LEN;

/// Metadata and on-disk locations of one built index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub doc_type: String,
    pub model_name: String,
    pub vector_dimension: usize,
    pub vector_count: usize,
    pub index_path: PathBuf,
    pub id_map_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Built,
    Loaded,
}

/// A loaded index: descriptor, row-major vectors, and internal id -> chunk id.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    pub descriptor: IndexDescriptor,
    pub origin: IndexOrigin,
    data: Vec<f32>,
    id_map: Vec<String>,
}

impl VectorIndex {
    pub fn len(&self) -> usize {
        self.descriptor.vector_count
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.vector_count == 0
    }

    pub fn dimension(&self) -> usize {
        self.descriptor.vector_dimension
    }

    /// Chunk id for an internal id.
    pub fn chunk_id(&self, internal_id: usize) -> Option<&str> {
        self.id_map.get(internal_id).map(String::as_str)
    }

    /// The `k` closest vectors as `(internal id, squared L2 distance)`,
    /// closest first. Ties resolve to the lower internal id.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let dim = self.dimension();
        if k == 0 || dim == 0 || query.len() != dim {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(dim)
            .enumerate()
            .map(|(i, row)| (i, squared_l2(query, row)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub struct IndexManager {
    dir: PathBuf,
}

impl IndexManager {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            dir: project_dir.join("indexes"),
        }
    }

    fn paths(&self, doc_type: &str, model: &str) -> (PathBuf, PathBuf) {
        // Sanitizing can map distinct model names together; the hash keeps them apart.
        let digest = Sha256::digest(format!("{}\u{0}{}", doc_type, model).as_bytes());
        let stem = format!(
            "{}_{}_{}",
            sanitize_component(doc_type),
            sanitize_component(model),
            &hex::encode(digest)[..8]
        );
        (
            self.dir.join(format!("{}.idx", stem)),
            self.dir.join(format!("{}.map.json", stem)),
        )
    }

    /// Load the persisted index for `(doc_type, model)` if it matches
    /// `chunks` exactly, otherwise build and persist a new one.
    ///
    /// Returns `Ok(None)` when there is nothing to index (no chunks, or the
    /// first chunk has an empty vector). Fails only if a rebuilt index
    /// cannot be written.
    pub fn build_or_load(
        &self,
        chunks: &[EmbeddingChunk],
        doc_type: &str,
        model: &str,
        force_rebuild: bool,
    ) -> std::io::Result<Option<VectorIndex>> {
        let Some(first) = chunks.first() else {
            tracing::info!(doc_type, model, "index: no chunks to index");
            return Ok(None);
        };
        let dim = first.vector.len();
        if dim == 0 {
            tracing::warn!(doc_type, model, "index: first vector is empty, cannot infer dimension");
            return Ok(None);
        }

        let usable = usable_chunks(chunks, dim);
        let (index_path, id_map_path) = self.paths(doc_type, model);
        let descriptor = IndexDescriptor {
            doc_type: doc_type.to_string(),
            model_name: model.to_string(),
            vector_dimension: dim,
            vector_count: usable.len(),
            index_path,
            id_map_path,
        };

        if !force_rebuild && descriptor.index_path.exists() && descriptor.id_map_path.exists() {
            match load(&descriptor) {
                Ok((data, id_map)) => match check_consistency(&descriptor, &data, &id_map, &usable)
                {
                    Ok(()) => {
                        tracing::info!(
                            doc_type,
                            model,
                            vectors = id_map.len(),
                            "index: loaded persisted index"
                        );
                        return Ok(Some(VectorIndex {
                            descriptor,
                            origin: IndexOrigin::Loaded,
                            data,
                            id_map,
                        }));
                    }
                    Err(reason) => {
                        tracing::info!(doc_type, model, %reason, "index: stale, rebuilding")
                    }
                },
                Err(reason) => {
                    tracing::warn!(doc_type, model, %reason, "index: unreadable, rebuilding")
                }
            }
        }

        let mut data = Vec::with_capacity(usable.len() * dim);
        let mut id_map = Vec::with_capacity(usable.len());
        for chunk in &usable {
            data.extend_from_slice(&chunk.vector);
            id_map.push(chunk.id.clone());
        }

        persist(&descriptor, &data, &id_map)?;
        tracing::info!(doc_type, model, vectors = id_map.len(), dim, "index: built");

        Ok(Some(VectorIndex {
            descriptor,
            origin: IndexOrigin::Built,
            data,
            id_map,
        }))
    }
}

/// Chunks that can go into an index of dimension `dim`, first occurrence of
/// each id only.
fn usable_chunks(chunks: &[EmbeddingChunk], dim: usize) -> Vec<&EmbeddingChunk> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| {
            if c.vector.len() != dim {
                tracing::warn!(
                    chunk = %c.id,
                    expected = dim,
                    actual = c.vector.len(),
                    "index: skipping chunk with mismatched dimension"
                );
                return false;
            }
            if !seen.insert(c.id.as_str()) {
                tracing::warn!(chunk = %c.id, "index: skipping duplicate chunk id");
                return false;
            }
            true
        })
        .collect()
}

fn check_consistency(
    descriptor: &IndexDescriptor,
    data: &[f32],
    id_map: &[String],
    usable: &[&EmbeddingChunk],
) -> Result<(), String> {
    let loaded_dim = data.len().checked_div(id_map.len()).unwrap_or(0);
    if !id_map.is_empty() && loaded_dim != descriptor.vector_dimension {
        return Err(format!(
            "dimension {} does not match {}",
            loaded_dim, descriptor.vector_dimension
        ));
    }
    if id_map.len() != usable.len() {
        return Err(format!(
            "index holds {} vectors, {} chunks supplied",
            id_map.len(),
            usable.len()
        ));
    }
    let persisted: HashSet<&str> = id_map.iter().map(String::as_str).collect();
    if persisted.len() != id_map.len() {
        return Err("id map contains duplicates".to_string());
    }
    if usable.iter().any(|c| !persisted.contains(c.id.as_str())) {
        return Err("chunk id set differs".to_string());
    }
    Ok(())
}

fn load(descriptor: &IndexDescriptor) -> Result<(Vec<f32>, Vec<String>), String> {
    let bytes = std::fs::read(&descriptor.index_path).map_err(|e| e.to_string())?;
    let map_bytes = std::fs::read(&descriptor.id_map_path).map_err(|e| e.to_string())?;
    let id_map: Vec<String> = serde_json::from_slice(&map_bytes).map_err(|e| e.to_string())?;

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err("not an index file".to_string());
    }
    let version = read_u32(&bytes[4..8]);
    if version != VERSION {
        return Err(format!("unsupported index version {}", version));
    }
    let dim = read_u32(&bytes[8..12]) as usize;
    let count = u64::from_le_bytes(read_array(&bytes[12..20])) as usize;
    if bytes[20..HEADER_LEN] != Sha256::digest(&map_bytes)[..] {
        return Err("id map was not written with this index".to_string());
    }
    let body = &bytes[HEADER_LEN..];

    if dim.checked_mul(count).and_then(|n| n.checked_mul(4)) != Some(body.len()) {
        return Err(format!(
            "header says {} x {} but body holds {} bytes",
            count,
            dim,
            body.len()
        ));
    }
    if count != id_map.len() {
        return Err(format!(
            "index holds {} vectors but id map has {} entries",
            count,
            id_map.len()
        ));
    }
    if dim != descriptor.vector_dimension {
        return Err(format!(
            "dimension {} does not match {}",
            dim, descriptor.vector_dimension
        ));
    }

    Ok((blob_to_vec(body), id_map))
}

fn persist(descriptor: &IndexDescriptor, data: &[f32], id_map: &[String]) -> std::io::Result<()> {
    let map_json = serde_json::to_vec(id_map)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + data.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(descriptor.vector_dimension as u32).to_le_bytes());
    bytes.extend_from_slice(&(id_map.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&Sha256::digest(&map_json));
    bytes.extend_from_slice(&vec_to_blob(data));

    // A crash between the two renames leaves a map whose digest differs from
    // the one in the vector file.
    write_atomic(&descriptor.index_path, &bytes)?;
    write_atomic(&descriptor.id_map_path, &map_json)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(read_array(bytes))
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(id: &str, vector: Vec<f32>) -> EmbeddingChunk {
        EmbeddingChunk {
            id: id.to_string(),
            parent_document_id: "doc".to_string(),
            chunk_text: format!("text {}", id),
            vector,
            chunk_index: 0,
            total_chunks: 1,
            locator: None,
            source_document_name: "doc.md".to_string(),
        }
    }

    fn set_a() -> Vec<EmbeddingChunk> {
        vec![
            chunk("a1", vec![1.0, 0.0, 0.0]),
            chunk("a2", vec![0.0, 1.0, 0.0]),
        ]
    }

    #[test]
    fn test_empty_input_yields_none() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        assert!(mgr.build_or_load(&[], "procedure", "m", false).unwrap().is_none());
        let zero = vec![chunk("z", vec![])];
        assert!(mgr.build_or_load(&zero, "procedure", "m", false).unwrap().is_none());
    }

    #[test]
    fn test_build_then_load() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        let built = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        assert_eq!(built.origin, IndexOrigin::Built);
        assert_eq!(built.descriptor.vector_count, 2);
        assert_eq!(built.descriptor.vector_dimension, 3);
        assert!(built.descriptor.index_path.exists());
        assert!(built.descriptor.id_map_path.exists());

        // Same ids in a different order still match.
        let mut reordered = set_a();
        reordered.reverse();
        let loaded = mgr.build_or_load(&reordered, "procedure", "m", false).unwrap().unwrap();
        assert_eq!(loaded.origin, IndexOrigin::Loaded);
        assert_eq!(loaded.chunk_id(0), Some("a1"));
        assert_eq!(loaded.descriptor, built.descriptor);
    }

    #[test]
    fn test_different_chunk_set_rebuilds() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap();

        let set_b = vec![
            chunk("b1", vec![1.0, 1.0, 0.0]),
            chunk("b2", vec![0.0, 1.0, 1.0]),
            chunk("b3", vec![1.0, 0.0, 1.0]),
        ];
        let idx = mgr.build_or_load(&set_b, "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);
        assert_eq!(idx.descriptor.vector_count, set_b.len());
        assert_eq!(idx.chunk_id(2), Some("b3"));

        // Same size, different ids.
        let set_c = vec![
            chunk("c1", vec![1.0, 1.0, 0.0]),
            chunk("c2", vec![0.0, 1.0, 1.0]),
            chunk("b3", vec![1.0, 0.0, 1.0]),
        ];
        let idx = mgr.build_or_load(&set_c, "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);
    }

    #[test]
    fn test_dimension_change_rebuilds() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap();
        let wider = vec![chunk("a1", vec![1.0, 0.0, 0.0, 0.0]), chunk("a2", vec![0.0; 4])];
        let idx = mgr.build_or_load(&wider, "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);
        assert_eq!(idx.dimension(), 4);
    }

    #[test]
    fn test_force_rebuild() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap();
        let idx = mgr.build_or_load(&set_a(), "procedure", "m", true).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);
    }

    #[test]
    fn test_corrupt_or_orphaned_files_rebuild() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        let built = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();

        std::fs::write(&built.descriptor.index_path, b"garbage").unwrap();
        let idx = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);

        std::fs::remove_file(&built.descriptor.id_map_path).unwrap();
        let idx = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);

        std::fs::write(&built.descriptor.id_map_path, b"[\"a1\"]").unwrap();
        let idx = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);
    }

    #[test]
    fn test_map_from_another_build_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        let built = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        let map_a = std::fs::read(&built.descriptor.id_map_path).unwrap();

        // Same count and dimension, different ids and vectors.
        let set_b = vec![
            chunk("b1", vec![9.0, 9.0, 9.0]),
            chunk("b2", vec![8.0, 8.0, 8.0]),
        ];
        mgr.build_or_load(&set_b, "procedure", "m", false).unwrap();

        // Vectors from the second build next to the map from the first, as
        // after a crash between the two renames.
        std::fs::write(&built.descriptor.id_map_path, &map_a).unwrap();

        let idx = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.origin, IndexOrigin::Built);
        let hits = idx.nearest(&[1.0, 0.0, 0.0], 1);
        assert_eq!(hits, vec![(0, 0.0)]);
        assert_eq!(idx.chunk_id(0), Some("a1"));
    }

    #[test]
    fn test_models_get_separate_files() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        let a = mgr.build_or_load(&set_a(), "procedure", "model/a", false).unwrap().unwrap();
        let b = mgr.build_or_load(&set_a(), "procedure", "model:a", false).unwrap().unwrap();
        assert_ne!(a.descriptor.index_path, b.descriptor.index_path);
    }

    #[test]
    fn test_mismatched_vectors_skipped() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        let mut chunks = set_a();
        chunks.push(chunk("bad", vec![1.0]));
        chunks.push(chunk("a1", vec![1.0, 0.0, 0.0]));
        let idx = mgr.build_or_load(&chunks, "procedure", "m", false).unwrap().unwrap();
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_nearest_is_exact() {
        let tmp = TempDir::new().unwrap();
        let mgr = IndexManager::new(tmp.path());
        let idx = mgr.build_or_load(&set_a(), "procedure", "m", false).unwrap().unwrap();
        let hits = idx.nearest(&[0.0, 0.9, 0.0], 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 0.01).abs() < 1e-6);
        assert!((hits[1].1 - 1.81).abs() < 1e-6);
        assert!(idx.nearest(&[0.0, 1.0], 5).is_empty());
    }
}
