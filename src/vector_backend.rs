use crate::error::Result;
use crate::types::{FieldCategory, RecordId, StoreScope, VectorHit};
use async_trait::async_trait;

/// Per-category vector index keyed by (record id, category, scope)
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    fn name(&self) -> &'static str;
    fn dimension(&self) -> usize;

    /// Add one vector. Fails with `DuplicateEmbedding` if the key is taken.
    async fn index(
        &self,
        record_id: RecordId,
        category: FieldCategory,
        scope: StoreScope,
        vector: &[f32],
    ) -> Result<()>;

    /// Nearest neighbours in one category and scope, best first
    async fn query(
        &self,
        vector: &[f32],
        category: FieldCategory,
        limit: usize,
        scope: StoreScope,
    ) -> Result<Vec<VectorHit>>;

    /// Drop every category's vector for `record_ids` in `scope`
    async fn delete_by_record_ids(&self, record_ids: &[RecordId], scope: StoreScope) -> Result<u64>;

    /// Re-key all vectors of `old_id` in `from` to `new_id` in `to`.
    /// Returns how many vectors moved, 0 if they were already moved.
    /// Repeating a move that failed part way must not leave duplicates
    /// under `new_id`.
    async fn move_by_record_id(
        &self,
        old_id: RecordId,
        new_id: RecordId,
        from: StoreScope,
        to: StoreScope,
    ) -> Result<u64>;

    async fn count(&self, scope: StoreScope) -> Result<i64>;
}

#[cfg(feature = "lancedb")]
pub mod lancedb {
    use super::*;
    use crate::error::MemoryError;
    use arrow_array::{
        types::Float32Type, Array, ArrayRef, FixedSizeListArray, Float32Array, Float64Array,
        Int64Array, RecordBatch, RecordBatchIterator, StringArray,
    };
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use ::lancedb::connect;
    use ::lancedb::query::{ExecutableQuery, QueryBase};
    use ::lancedb::table::Table;
    use futures::StreamExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const TABLE_NAME: &str = "momentum_embeddings";

    /// LanceDB-backed index. Moves are clear-add-delete and not atomic; a
    /// crash part way leaves the vectors under both keys until the move
    /// is repeated, and the repeat replaces the target rows.
    ///
    /// The duplicate check in `index` is count-then-add. Callers index a
    /// record only under its root's lock, which keeps two writers off the
    /// same key.
    #[derive(Debug)]
    pub struct LanceDbEmbeddingIndex {
        path: PathBuf,
        dimension: usize,
        table: RwLock<Option<Table>>,
    }

    impl LanceDbEmbeddingIndex {
        pub fn new(path: impl AsRef<Path>, dimension: usize) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
                dimension,
                table: RwLock::new(None),
            }
        }

        fn schema(&self) -> SchemaRef {
            Arc::new(Schema::new(vec![
                Field::new("record_id", DataType::Int64, false),
                Field::new("category", DataType::Utf8, false),
                Field::new("scope", DataType::Utf8, false),
                Field::new(
                    "vector",
                    DataType::FixedSizeList(
                        Arc::new(Field::new("item", DataType::Float32, true)),
                        self.dimension as i32,
                    ),
                    false,
                ),
            ]))
        }

        async fn get_or_init_table(&self) -> Result<Table> {
            {
                let guard = self.table.read().await;
                if let Some(t) = guard.as_ref() {
                    return Ok(t.clone());
                }
            }

            let mut guard = self.table.write().await;
            if let Some(t) = guard.as_ref() {
                return Ok(t.clone());
            }

            std::fs::create_dir_all(&self.path)
                .map_err(|e| MemoryError::VectorDb(format!("Failed to create lancedb dir: {e}")))?;

            let uri = self.path.to_string_lossy().to_string();
            let db = connect(&uri)
                .execute()
                .await
                .map_err(|e| MemoryError::StoreUnavailable(format!("Failed to connect to lancedb: {e}")))?;

            let table = match db.open_table(TABLE_NAME).execute().await {
                Ok(t) => t,
                Err(_) => db
                    .create_empty_table(TABLE_NAME, self.schema())
                    .execute()
                    .await
                    .map_err(|e| {
                        MemoryError::VectorDb(format!("Failed to create lancedb table: {e}"))
                    })?,
            };

            *guard = Some(table.clone());
            Ok(table)
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

        fn batch(&self, rows: &[(RecordId, String, StoreScope, Vec<f32>)]) -> Result<RecordBatch> {
            let ids: ArrayRef = Arc::new(Int64Array::from(
                rows.iter().map(|r| r.0).collect::<Vec<_>>(),
            ));
            let categories: ArrayRef = Arc::new(StringArray::from(
                rows.iter().map(|r| r.1.clone()).collect::<Vec<_>>(),
            ));
            let scopes: ArrayRef = Arc::new(StringArray::from(
                rows.iter().map(|r| r.2.as_str()).collect::<Vec<_>>(),
            ));
            let list = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                rows.iter()
                    .map(|r| Some(r.3.iter().map(|v| Some(*v)).collect::<Vec<_>>())),
                self.dimension as i32,
            );
            let vectors: ArrayRef = Arc::new(list);

            RecordBatch::try_new(self.schema(), vec![ids, categories, scopes, vectors])
                .map_err(|e| MemoryError::VectorDb(format!("Failed to build record batch: {e}")))
        }

        async fn add(&self, table: &Table, batch: RecordBatch) -> Result<()> {
            let schema = batch.schema();
            let batches = Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema));
            table
                .add(batches)
                .execute()
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB add failed: {e}")))?;
            Ok(())
        }
    }

    fn key_filter(record_id: RecordId, scope: StoreScope) -> String {
        format!("record_id = {record_id} AND scope = '{}'", scope.as_str())
    }

    fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
        batch
            .column_by_name(name)
            .ok_or_else(|| MemoryError::VectorDb(format!("LanceDB results missing '{name}' column")))?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| MemoryError::VectorDb(format!("LanceDB '{name}' column type mismatch")))
    }

    #[async_trait]
    impl EmbeddingIndex for LanceDbEmbeddingIndex {
        fn name(&self) -> &'static str {
            "lancedb"
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
            let table = self.get_or_init_table().await?;

            let filter = format!(
                "{} AND category = '{}'",
                key_filter(record_id, scope),
                category.as_str()
            );
            let existing = table
                .count_rows(Some(filter))
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB count failed: {e}")))?;
            if existing > 0 {
                return Err(MemoryError::DuplicateEmbedding {
                    record_id,
                    category,
                    scope,
                });
            }

            let batch = self.batch(&[(record_id, category.as_str().to_string(), scope, vector.to_vec())])?;
            self.add(&table, batch).await
        }

        async fn query(
            &self,
            vector: &[f32],
            category: FieldCategory,
            limit: usize,
            scope: StoreScope,
        ) -> Result<Vec<VectorHit>> {
            if limit == 0 {
                return Err(MemoryError::InvalidLimit("query limit must be at least 1".into()));
            }
            self.check_dimension(vector)?;
            let table = self.get_or_init_table().await?;

            let mut stream = table
                .vector_search(vector)
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB vector_search failed: {e}")))?
                .only_if(format!(
                    "category = '{}' AND scope = '{}'",
                    category.as_str(),
                    scope.as_str()
                ))
                .limit(limit)
                .execute()
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB search failed: {e}")))?;

            let mut hits = Vec::new();
            while let Some(batch) = stream.next().await {
                let batch = batch
                    .map_err(|e| MemoryError::VectorDb(format!("LanceDB stream error: {e}")))?;
                if batch.num_rows() == 0 {
                    continue;
                }

                let ids = column::<Int64Array>(&batch, "record_id")?;
                let distance_f32 = batch
                    .column_by_name("_distance")
                    .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
                let distance_f64 = batch
                    .column_by_name("_distance")
                    .and_then(|c| c.as_any().downcast_ref::<Float64Array>());

                for row in 0..batch.num_rows() {
                    // L2 distance mapped into (0, 1], higher is closer
                    let score = if let Some(dist) = distance_f32 {
                        1.0 / (1.0 + dist.value(row).max(0.0))
                    } else if let Some(dist) = distance_f64 {
                        1.0 / (1.0 + dist.value(row).max(0.0) as f32)
                    } else {
                        1.0
                    };

                    hits.push(VectorHit {
                        record_id: ids.value(row),
                        score,
                    });
                }
            }

            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
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
            let table = self.get_or_init_table().await?;

            let id_list = record_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let filter = format!("record_id IN ({id_list}) AND scope = '{}'", scope.as_str());

            let existing = table
                .count_rows(Some(filter.clone()))
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB count failed: {e}")))?;
            table
                .delete(&filter)
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB delete failed: {e}")))?;

            Ok(existing as u64)
        }

        async fn move_by_record_id(
            &self,
            old_id: RecordId,
            new_id: RecordId,
            from: StoreScope,
            to: StoreScope,
        ) -> Result<u64> {
            let table = self.get_or_init_table().await?;
            let filter = key_filter(old_id, from);
            let target = key_filter(new_id, to);
            if filter == target {
                let existing = table
                    .count_rows(Some(filter))
                    .await
                    .map_err(|e| MemoryError::VectorDb(format!("LanceDB count failed: {e}")))?;
                return Ok(existing as u64);
            }

            let mut stream = table
                .query()
                .only_if(filter.clone())
                .execute()
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB query failed: {e}")))?;

            let mut rows = Vec::new();
            while let Some(batch) = stream.next().await {
                let batch = batch
                    .map_err(|e| MemoryError::VectorDb(format!("LanceDB stream error: {e}")))?;
                let categories = column::<StringArray>(&batch, "category")?;
                let vectors = column::<FixedSizeListArray>(&batch, "vector")?;

                for row in 0..batch.num_rows() {
                    let values = vectors.value(row);
                    let values = values
                        .as_any()
                        .downcast_ref::<Float32Array>()
                        .ok_or_else(|| {
                            MemoryError::VectorDb("LanceDB 'vector' item type mismatch".into())
                        })?;
                    rows.push((
                        new_id,
                        categories.value(row).to_string(),
                        to,
                        values.values().to_vec(),
                    ));
                }
            }

            if rows.is_empty() {
                return Ok(0);
            }

            let moved = rows.len() as u64;
            // rows left under the target by an interrupted move
            table
                .delete(&target)
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB delete failed: {e}")))?;
            self.add(&table, self.batch(&rows)?).await?;
            table
                .delete(&filter)
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB delete failed: {e}")))?;

            Ok(moved)
        }

        async fn count(&self, scope: StoreScope) -> Result<i64> {
            let table = self.get_or_init_table().await?;
            let count = table
                .count_rows(Some(format!("scope = '{}'", scope.as_str())))
                .await
                .map_err(|e| MemoryError::VectorDb(format!("LanceDB count failed: {e}")))?;
            Ok(count as i64)
        }
    }

}
