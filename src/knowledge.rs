use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::index::{IndexEntry, VectorIndex};
use crate::models::{Document, RetrievedPassage};

/// The ingest-and-retrieve facade over one vector index and one embedder.
///
/// Ingests of the same document id serialize on a per-id lock; disjoint
/// ingests and all retrievals run concurrently. An ingest either indexes the
/// whole document or leaves the index as it was.
pub struct KnowledgeBase {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunking: ChunkingConfig,
    ingest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KnowledgeBase {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            chunking,
            ingest_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Chunk, embed, and index one document. Embedding happens entirely
    /// before any write, so a provider failure part-way through leaves zero
    /// entries for the document. Re-ingesting an id replaces its prior
    /// entries in the same transaction that inserts the new ones.
    pub async fn ingest(&self, doc: &Document) -> Result<usize> {
        let lock = self.lock_for(&doc.id).await;
        let result = {
            let _guard = lock.lock().await;
            self.ingest_locked(doc).await
        };
        drop(lock);
        self.evict_idle_lock(&doc.id).await;
        result
    }

    async fn ingest_locked(&self, doc: &Document) -> Result<usize> {
        let chunks = chunk_text(
            &doc.id,
            &doc.raw_text,
            self.chunking.window_chars,
            self.chunking.overlap_chars,
        );
        if chunks.is_empty() {
            // An emptied source still replaces whatever it held before.
            self.index.replace_document(&doc.id, &[]).await?;
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(Error::ProviderUnavailable {
                provider: "embedding",
                message: format!(
                    "returned {} vectors for {} chunks",
                    vectors.len(),
                    chunks.len()
                ),
            });
        }

        let source = doc.source_meta();
        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                position: chunk.position_index,
                text: chunk.text,
                vector,
                source: source.clone(),
            })
            .collect();

        self.index.replace_document(&doc.id, &entries).await?;
        info!(document_id = %doc.id, origin = %doc.origin, chunks = entries.len(), "ingested document");
        Ok(entries.len())
    }

    /// Embed the query and run similarity search. Deterministic for a given
    /// index state and embedder.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedPassage>> {
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vec = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProviderUnavailable {
                provider: "embedding",
                message: "empty embedding response for query".into(),
            })?;
        self.index.search(&query_vec, k).await
    }

    async fn lock_for(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.ingest_locks.lock().await;
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a per-document lock nobody is holding anymore. Every clone goes
    /// through `lock_for` under the map lock, so a strong count of 1 here
    /// means only the map still references it.
    async fn evict_idle_lock(&self, document_id: &str) {
        let mut locks = self.ingest_locks.lock().await;
        let idle = locks
            .get(document_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(document_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use async_trait::async_trait;

    struct ZeroEmbedder {
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for ZeroEmbedder {
        fn model_name(&self) -> &str {
            "zero-test"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; self.dims]).collect())
        }
    }

    #[tokio::test]
    async fn test_ingest_locks_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(
            VectorIndex::open(&dir.path().join("kb.db"), "test", "zero-test", 4)
                .await
                .unwrap(),
        );
        let kb = Arc::new(KnowledgeBase::new(
            index,
            Arc::new(ZeroEmbedder { dims: 4 }),
            ChunkingConfig {
                window_chars: 40,
                overlap_chars: 0,
            },
        ));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let kb = kb.clone();
                tokio::spawn(async move {
                    let doc = Document::new(
                        crate::models::Origin::Upload {
                            label: format!("doc-{}", i % 2),
                        },
                        "some text worth indexing",
                    );
                    kb.ingest(&doc).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(kb.ingest_locks.lock().await.is_empty());
    }
}
