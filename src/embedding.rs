use crate::config::RetryPolicy;
use crate::error::{MemoryError, Result};
use crate::retry::with_retry;
use crate::types::{FieldCategory, NewRecord};
use async_trait::async_trait;
use futures::future::try_join_all;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic bag-of-words embedder.
///
/// Tokens are lowercased and hashed into a signed bucket, then the vector is
/// L2-normalized. Texts sharing words score high under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            let idx = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vec[idx] += sign;
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }

        vec
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash = 1469598103934665603u64;
    for b in token.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(1099511628211u64);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embed a single text, retrying transient provider failures
pub async fn embed_text(
    provider: &dyn EmbeddingProvider,
    text: &str,
    retry: RetryPolicy,
) -> Result<Vec<f32>> {
    let texts = [text.to_string()];
    let mut vectors = with_retry(retry, "embed", || provider.embed(&texts)).await?;

    let vector = vectors
        .pop()
        .ok_or_else(|| MemoryError::EmbeddingFailed(format!("{} returned no vector", provider.name())))?;
    if vector.len() != provider.dimension() {
        return Err(MemoryError::EmbeddingFailed(format!(
            "{} returned {} dimensions, expected {}",
            provider.name(),
            vector.len(),
            provider.dimension()
        )));
    }

    Ok(vector)
}

/// Embed the four text fields of a record concurrently, in
/// `FieldCategory::ALL` order
pub async fn embed_fields(
    provider: &dyn EmbeddingProvider,
    record: &NewRecord,
    retry: RetryPolicy,
) -> Result<Vec<(FieldCategory, Vec<f32>)>> {
    let vectors = try_join_all(
        FieldCategory::ALL
            .iter()
            .map(|category| embed_text(provider, record.field(*category), retry)),
    )
    .await?;

    Ok(FieldCategory::ALL.into_iter().zip(vectors).collect())
}
