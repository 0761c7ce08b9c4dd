//! k-nearest-neighbor retrieval over a [`VectorIndex`].
//!
//! Distance is squared Euclidean; scores are `1 / (1 + distance)`, so an
//! exact match scores `1.0` and every score falls in `(0, 1]`.

use std::collections::HashMap;

use crate::index::VectorIndex;
use crate::models::{EmbeddingChunk, EvidenceMatch};

/// Best-first evidence for `query`.
///
/// `k` is clamped to the index size. Internal ids whose chunk is missing from
/// `lookup` are logged and skipped, so fewer than `k` matches may come back.
pub fn retrieve(
    query: &[f32],
    index: &VectorIndex,
    lookup: &HashMap<String, EmbeddingChunk>,
    k: usize,
) -> Vec<EvidenceMatch> {
    let k = k.min(index.len());
    if k == 0 || index.dimension() == 0 {
        return Vec::new();
    }
    if query.len() != index.dimension() {
        tracing::warn!(
            query_dim = query.len(),
            index_dim = index.dimension(),
            "retrieve: query dimension does not match index"
        );
        return Vec::new();
    }

    index
        .nearest(query, k)
        .into_iter()
        .filter_map(|(internal_id, distance)| {
            let Some(chunk_id) = index.chunk_id(internal_id) else {
                tracing::warn!(internal_id, "retrieve: internal id outside id map");
                return None;
            };
            let Some(chunk) = lookup.get(chunk_id) else {
                tracing::warn!(internal_id, chunk = chunk_id, "retrieve: no chunk for id, skipping");
                return None;
            };
            Some(EvidenceMatch {
                excerpt: chunk.chunk_text.clone(),
                source_document_name: chunk.source_document_name.clone(),
                locator: chunk.locator.clone(),
                score: 1.0 / (1.0 + distance as f64),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexManager;
    use tempfile::TempDir;

    fn chunk(id: &str, vector: Vec<f32>) -> EmbeddingChunk {
        EmbeddingChunk {
            id: id.to_string(),
            parent_document_id: "doc".to_string(),
            chunk_text: format!("excerpt {}", id),
            vector,
            chunk_index: 0,
            total_chunks: 1,
            locator: Some("line 1".to_string()),
            source_document_name: "policy.pdf".to_string(),
        }
    }

    /// Deterministic pseudo-random vectors (xorshift) so the test needs no extra crate.
    fn pseudo_random(seed: u64, dim: usize) -> Vec<f32> {
        let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..dim)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x % 10_000) as f32 / 10_000.0
            })
            .collect()
    }

    fn setup(n: usize) -> (TempDir, VectorIndex, HashMap<String, EmbeddingChunk>) {
        let tmp = TempDir::new().unwrap();
        let chunks: Vec<EmbeddingChunk> = (0..n)
            .map(|i| chunk(&format!("c{}", i), pseudo_random(i as u64 + 1, 16)))
            .collect();
        let idx = IndexManager::new(tmp.path())
            .build_or_load(&chunks, "procedure", "m", false)
            .unwrap()
            .unwrap();
        let lookup = chunks.into_iter().map(|c| (c.id.clone(), c)).collect();
        (tmp, idx, lookup)
    }

    #[test]
    fn test_identical_vector_is_top_result() {
        let (_tmp, idx, lookup) = setup(20);
        let query = lookup["c7"].vector.clone();
        let hits = retrieve(&query, &idx, &lookup, 5);
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].excerpt, "excerpt c7");
        assert!(hits[0].score > 0.999);
        assert_eq!(hits[0].source_document_name, "policy.pdf");
        assert_eq!(hits[0].locator.as_deref(), Some("line 1"));
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(hits.iter().all(|h| h.score > 0.0 && h.score <= 1.0));
    }

    #[test]
    fn test_k_zero_and_k_clamped() {
        let (_tmp, idx, lookup) = setup(4);
        let query = pseudo_random(99, 16);
        assert!(retrieve(&query, &idx, &lookup, 0).is_empty());
        assert_eq!(retrieve(&query, &idx, &lookup, 50).len(), 4);
    }

    #[test]
    fn test_missing_lookup_entry_skipped() {
        let (_tmp, idx, mut lookup) = setup(3);
        let query = lookup["c0"].vector.clone();
        lookup.remove("c0");
        let hits = retrieve(&query, &idx, &lookup, 3);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.excerpt != "excerpt c0"));
    }

    #[test]
    fn test_dimension_mismatch_returns_empty() {
        let (_tmp, idx, lookup) = setup(3);
        assert!(retrieve(&[1.0, 2.0], &idx, &lookup, 3).is_empty());
    }
}
