//! Cached document embedding.
//!
//! [`Embedder::embed`] chunks a [`NormalizedDocument`] and embeds every chunk
//! through the [`Gateway`]. Two cache layers make the work resumable:
//!
//! - the complete chunk list for `(document id, model, max_tokens)` is stored
//!   once every chunk has a vector (an empty list included);
//! - each chunk vector is stored under its chunk id as soon as it arrives, so
//!   a document interrupted by a transient failure only re-requests the
//!   chunks it is still missing.
//!
//! Transient failures end the document early and return what was embedded.
//! Authentication failures return [`AuthenticationFailed`] immediately.

use crate::cache::ContentCache;
use crate::chunk::{chunk_with_offsets, line_at, TextChunk};
use crate::error::{AuthenticationFailed, GatewayError};
use crate::llm::{Gateway, LanguageModel};
use crate::models::{DocumentMetadata, EmbeddingChunk, NormalizedDocument};

pub struct Embedder<'a> {
    gateway: Gateway<'a>,
    cache: &'a ContentCache,
    batch_size: usize,
}

impl<'a> Embedder<'a> {
    pub fn new(backend: &'a dyn LanguageModel, cache: &'a ContentCache, batch_size: usize) -> Self {
        Self {
            gateway: Gateway::new(backend),
            cache,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn embed(
        &self,
        doc: &NormalizedDocument,
        model: &str,
        max_tokens: usize,
    ) -> Result<Vec<EmbeddingChunk>, AuthenticationFailed> {
        let max_tokens_str = max_tokens.to_string();
        let doc_key = ContentCache::key(&[&doc.id, "embeddings", model, &max_tokens_str]);
        if let Some(cached) = self.cache.get_record::<Vec<EmbeddingChunk>>(&doc_key) {
            tracing::debug!(doc = %doc.id, chunks = cached.len(), "embeddings cache hit");
            return Ok(cached);
        }

        let pieces = chunk_with_offsets(&doc.text_content, max_tokens);
        let total_chunks = pieces.len();
        let mut chunks: Vec<EmbeddingChunk> = Vec::with_capacity(total_chunks);

        for (window_index, window) in pieces.chunks(self.batch_size).enumerate() {
            let base = window_index * self.batch_size;
            let ids: Vec<String> = (0..window.len())
                .map(|i| chunk_id(&doc.id, base + i, model, &max_tokens_str))
                .collect();

            let mut vectors: Vec<Option<Vec<f32>>> =
                ids.iter().map(|id| self.cache.get_vector(id)).collect();
            let missing: Vec<usize> = (0..window.len()).filter(|&i| vectors[i].is_none()).collect();

            if !missing.is_empty() {
                let texts: Vec<String> = missing
                    .iter()
                    .map(|&i| window[i].text.replace(['\n', '\r'], " "))
                    .collect();
                match self.gateway.embed(model, &texts).await {
                    Ok(embedded) => {
                        for (&i, vector) in missing.iter().zip(embedded) {
                            self.cache.put_vector(&ids[i], &vector);
                            vectors[i] = Some(vector);
                        }
                    }
                    Err(GatewayError::Authentication(msg)) => {
                        return Err(AuthenticationFailed(msg));
                    }
                    Err(e) => {
                        tracing::warn!(
                            doc = %doc.id,
                            embedded = chunks.len(),
                            total = total_chunks,
                            error = %e,
                            "embedding interrupted, keeping partial result"
                        );
                        return Ok(chunks);
                    }
                }
            }

            for ((piece, id), vector) in window.iter().zip(ids).zip(vectors) {
                let Some(vector) = vector else { continue };
                chunks.push(make_chunk(doc, piece, id, vector, chunks.len(), total_chunks));
            }
        }

        self.cache.put_record(&doc_key, &chunks);
        tracing::info!(doc = %doc.id, chunks = chunks.len(), model, "document embedded");
        Ok(chunks)
    }

    /// Embed a search query as a one-off single-chunk document.
    ///
    /// Returns `None` when the text is blank or the service gave no vector.
    pub async fn embed_query(
        &self,
        text: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, AuthenticationFailed> {
        let doc = NormalizedDocument {
            id: format!("query_{}", ContentCache::key(&["query", text])),
            text_content: text.to_string(),
            sections: Vec::new(),
            doc_type: "query".to_string(),
            metadata: DocumentMetadata::default(),
        };
        let chunks = self.embed(&doc, model, usize::MAX).await?;
        Ok(chunks.into_iter().next().map(|c| c.vector))
    }
}

fn chunk_id(doc_id: &str, index: usize, model: &str, max_tokens: &str) -> String {
    ContentCache::key(&[doc_id, "chunk", &index.to_string(), model, max_tokens])
}

fn make_chunk(
    doc: &NormalizedDocument,
    piece: &TextChunk,
    id: String,
    vector: Vec<f32>,
    chunk_index: usize,
    total_chunks: usize,
) -> EmbeddingChunk {
    // Windows can open on a line break; locate the first visible character.
    let leading = piece.text.len() - piece.text.trim_start().len();
    EmbeddingChunk {
        id,
        parent_document_id: doc.id.clone(),
        chunk_text: piece.text.clone(),
        vector,
        chunk_index,
        total_chunks,
        locator: Some(format!("line {}", line_at(&doc.text_content, piece.start + leading))),
        source_document_name: doc.metadata.original_filename.clone(),
    }
}
