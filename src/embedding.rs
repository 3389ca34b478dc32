use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Anything that can turn text into fixed-size vectors. Implementations must
/// preserve input order and return one vector per input.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// OpenAI-compatible `/embeddings` client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            Error::Config(format!(
                "embedding API key env var {} is not set",
                config.api_key_env
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    let parsed: serde_json::Value = r.json().await.map_err(|e| {
                        Error::ProviderUnavailable {
                            provider: "embedding",
                            message: format!("invalid response body: {e}"),
                        }
                    })?;
                    return parse_embedding_response(&parsed, texts.len());
                }
                Ok(r) => {
                    let status = r.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let detail = r.text().await.unwrap_or_default();
                    if !retryable || attempt > self.max_retries {
                        return Err(Error::ProviderUnavailable {
                            provider: "embedding",
                            message: format!("HTTP {status}: {detail}"),
                        });
                    }
                    warn!(%status, attempt, "embedding request failed, retrying");
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(Error::ProviderUnavailable {
                            provider: "embedding",
                            message: e.to_string(),
                        });
                    }
                    warn!(error = %e, attempt, "embedding request failed, retrying");
                }
            }

            // 1s, 2s, 4s ... capped at 32s
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let vectors = self.embed_batch(batch).await?;
            for v in &vectors {
                if v.len() != self.dims {
                    return Err(Error::DimensionMismatch {
                        expected: self.dims,
                        got: v.len(),
                    });
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_embedding_response(value: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = value
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::ProviderUnavailable {
            provider: "embedding",
            message: "response missing 'data' array".into(),
        })?;
    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::ProviderUnavailable {
                provider: "embedding",
                message: "response item missing 'embedding'".into(),
            })?;
        let mut vector = Vec::with_capacity(embedding.len());
        for component in embedding {
            let value = component.as_f64().ok_or_else(|| Error::ProviderUnavailable {
                provider: "embedding",
                message: format!("non-numeric embedding component: {component}"),
            })?;
            vector.push(value as f32);
        }
        vectors.push(vector);
    }
    if vectors.len() != expected {
        return Err(Error::ProviderUnavailable {
            provider: "embedding",
            message: format!("asked for {expected} embeddings, got {}", vectors.len()),
        });
    }
    Ok(vectors)
}

/// Serialize a vector to little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Deserialize a BLOB back into a vector. Truncates any trailing partial f32.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let vec = vec![0.1f32, -2.5, 3.25, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_parse_embedding_response() {
        let value = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });
        let vecs = parse_embedding_response(&value, 2).unwrap();
        assert_eq!(vecs.len(), 2);
        assert!((vecs[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_embedding_response_rejects_non_numeric() {
        let value = serde_json::json!({"data": [{"embedding": [0.1, "oops"]}]});
        let err = parse_embedding_response(&value, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::ProviderUnavailable {
                provider: "embedding",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_embedding_response_count_mismatch() {
        let value = serde_json::json!({"data": [{"embedding": [0.1]}]});
        assert!(parse_embedding_response(&value, 2).is_err());
    }
}
