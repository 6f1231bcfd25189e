//! Vector index stored alongside the lineage tables
//!
//! Vectors are bincode-encoded `Vec<f32>` blobs in the `embeddings` table and
//! queries are an exact cosine scan over one (scope, category) slice. Moving a
//! record's vectors between scopes is a single UPDATE, so a sweep that crashes
//! mid-move never leaves a record half in each scope.

use crate::error::{MemoryError, Result};
use crate::types::{FieldCategory, RecordId, StoreScope, VectorHit};
use crate::vector_backend::EmbeddingIndex;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// `EmbeddingIndex` over the shared SQLite pool
#[derive(Clone)]
pub struct SqliteEmbeddingIndex {
    pool: SqlitePool,
    dimension: usize,
}

impl std::fmt::Debug for SqliteEmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEmbeddingIndex")
            .field("dimension", &self.dimension)
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteEmbeddingIndex {
    pub fn new(pool: SqlitePool, dimension: usize) -> Arc<Self> {
        Arc::new(Self { pool, dimension })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::VectorDb(format!(
                "Vector dimension mismatch: got {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingIndex for SqliteEmbeddingIndex {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn index(
        &self,
        record_id: RecordId,
        category: FieldCategory,
        scope: StoreScope,
        vector: &[f32],
    ) -> Result<()> {
        self.check_dimension(vector)?;
        let data =
            bincode::serialize(vector).map_err(|e| MemoryError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO embeddings (record_id, category, scope, vector)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(record_id)
        .bind(category.as_str())
        .bind(scope.as_str())
        .bind(data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(MemoryError::DuplicateEmbedding {
                    record_id,
                    category,
                    scope,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn query(
        &self,
        vector: &[f32],
        category: FieldCategory,
        limit: usize,
        scope: StoreScope,
    ) -> Result<Vec<VectorHit>> {
        if limit == 0 {
            return Err(MemoryError::InvalidLimit(
                "query limit must be at least 1".into(),
            ));
        }
        self.check_dimension(vector)?;

        let rows = sqlx::query(
            "SELECT record_id, vector FROM embeddings WHERE scope = ? AND category = ?",
        )
        .bind(scope.as_str())
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let data: Vec<u8> = row.try_get("vector")?;
            let stored: Vec<f32> = bincode::deserialize(&data)
                .map_err(|e| MemoryError::Serialization(e.to_string()))?;

            hits.push(VectorHit {
                record_id: row.try_get("record_id")?,
                score: cosine_similarity(vector, &stored),
            });
        }

        // Sort by similarity (highest first), lower id on ties
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.record_id.cmp(&b.record_id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    async fn delete_by_record_ids(
        &self,
        record_ids: &[RecordId],
        scope: StoreScope,
    ) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = record_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "DELETE FROM embeddings WHERE scope = ? AND record_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(scope.as_str());
        for id in record_ids {
            query = query.bind(id);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn move_by_record_id(
        &self,
        old_id: RecordId,
        new_id: RecordId,
        from: StoreScope,
        to: StoreScope,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE embeddings SET record_id = ?, scope = ?
            WHERE record_id = ? AND scope = ?
            "#,
        )
        .bind(new_id)
        .bind(to.as_str())
        .bind(old_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(old_id, new_id, %from, %to, moved = result.rows_affected(), "Moved vectors");
        Ok(result.rows_affected())
    }

    async fn count(&self, scope: StoreScope) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM embeddings WHERE scope = ?")
            .bind(scope.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
