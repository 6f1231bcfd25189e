//! # Momentum - hierarchical episodic memory for multi-step reasoning agents
//!
//! Every reasoning step is a record in a scratch tree. Outcomes are
//! propagated up the tree, finished trees are consolidated into an archive
//! that can be searched by similarity, and a priority graph ranks which open
//! branch to work on next.

pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod error;
pub mod priority;
pub mod propagation;
pub mod retry;
pub mod storage_backend;
pub mod store;
pub mod types;
pub mod vector_backend;
pub mod vector_search;

pub use config::{MemoryConfig, MemoryConfigBuilder, RetryPolicy};
pub use consolidation::{order_leaves, ConsolidationEngine, ConsolidationReport, RootLocks};
pub use embedding::{embed_fields, embed_text, EmbeddingProvider, HashEmbeddingProvider};
pub use error::{MemoryError, Result};
pub use priority::{ChosenAction, NodeAttribute, PriorityGraph};
pub use propagation::StatusPropagator;
pub use retry::with_retry;
pub use storage_backend::{ArchiveStore, RecordStore};
pub use store::{connect, connect_in_memory, SqliteRecordStore};
pub use types::{
    ArchiveMatch, FieldCategory, FinalStatus, LeafInfo, MemoryRecord, MigratedRecord, NewRecord,
    RecordId, StoreScope, VectorHit, ROOT_PARENT,
};
pub use vector_backend::EmbeddingIndex;
pub use vector_search::{cosine_similarity, SqliteEmbeddingIndex};

use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Main memory system: scratch and archive stores, their vectors, and the
/// engines working on them
#[derive(Clone)]
pub struct MomentumMemory {
    config: MemoryConfig,
    scratch: Arc<dyn RecordStore>,
    archive: Arc<dyn ArchiveStore>,
    index: Arc<dyn EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    propagator: StatusPropagator,
    consolidator: Arc<ConsolidationEngine>,
    locks: RootLocks,
}

impl std::fmt::Debug for MomentumMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MomentumMemory")
            .field("data_dir", &self.config.data_dir)
            .field("index", &self.index.name())
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl MomentumMemory {
    /// Open (or create) the SQLite-backed memory under `config.data_dir`
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let pool = connect(config.database_path(), config.max_connections).await?;
        Self::from_pool(config, pool)
    }

    /// Throwaway memory in a single in-memory SQLite connection
    pub async fn in_memory() -> Result<Self> {
        Self::in_memory_with(MemoryConfig::default()).await
    }

    pub async fn in_memory_with(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let pool = connect_in_memory().await?;
        Self::from_pool(config, pool)
    }

    fn from_pool(config: MemoryConfig, pool: SqlitePool) -> Result<Self> {
        let scratch = SqliteRecordStore::scratch(pool.clone(), config.max_root_hops);
        let archive = SqliteRecordStore::archive(pool.clone(), config.max_root_hops);
        let index = SqliteEmbeddingIndex::new(pool, config.embedding_dimension);
        let embedder = Arc::new(HashEmbeddingProvider::new(config.embedding_dimension));

        Self::with_components(config, scratch, archive, index, embedder)
    }

    /// Assemble from explicit collaborators
    pub fn with_components(
        config: MemoryConfig,
        scratch: Arc<dyn RecordStore>,
        archive: Arc<dyn ArchiveStore>,
        index: Arc<dyn EmbeddingIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        if scratch.scope() != StoreScope::Scratch || archive.scope() != StoreScope::Archive {
            return Err(MemoryError::Configuration(format!(
                "expected scratch and archive stores, got {} and {}",
                scratch.scope(),
                archive.scope()
            )));
        }
        if index.dimension() != embedder.dimension() {
            return Err(MemoryError::Configuration(format!(
                "embedder '{}' produces {} dimensions but index '{}' stores {}",
                embedder.name(),
                embedder.dimension(),
                index.name(),
                index.dimension()
            )));
        }

        let locks = RootLocks::new();
        let propagator = StatusPropagator::new(Arc::clone(&scratch));
        let consolidator = Arc::new(ConsolidationEngine::new(
            Arc::clone(&scratch),
            Arc::clone(&archive),
            Arc::clone(&index),
            locks.clone(),
        ));

        Ok(Self {
            config,
            scratch,
            archive,
            index,
            embedder,
            propagator,
            consolidator,
            locks,
        })
    }

    /// Swap the vector index. Only safe before any step is saved.
    pub fn with_embedding_index(self, index: Arc<dyn EmbeddingIndex>) -> Result<Self> {
        Self::with_components(self.config, self.scratch, self.archive, index, self.embedder)
    }

    /// Swap the embedding provider
    pub fn with_embedder(self, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Self::with_components(self.config, self.scratch, self.archive, self.index, embedder)
    }

    // ─── Recording ───

    /// Record one reasoning step and return its id.
    ///
    /// All four fields are embedded before anything is written. If indexing
    /// fails after the insert, the row and any vectors already written are
    /// removed again.
    pub async fn save_step(&self, record: &NewRecord) -> Result<RecordId> {
        record.validate_shape()?;
        let vectors = embed_fields(self.embedder.as_ref(), record, self.config.retry).await?;

        let root_id = if record.parent_id == ROOT_PARENT {
            None
        } else {
            let root_id = self
                .scratch
                .get_root_id(record.parent_id)
                .await?
                .ok_or_else(|| MemoryError::Validation(format!(
                    "parent {} does not exist in scratch store",
                    record.parent_id
                )))?;
            Some(root_id)
        };

        let guard = match root_id {
            Some(root_id) => Some(self.locks.lock(root_id).await),
            None => None,
        };
        let result = self.insert_step(record, &vectors).await;
        drop(guard);
        if let Some(root_id) = root_id {
            self.locks.forget_if_idle(root_id).await;
        }

        result
    }

    async fn insert_step(
        &self,
        record: &NewRecord,
        vectors: &[(FieldCategory, Vec<f32>)],
    ) -> Result<RecordId> {
        let id = self.scratch.save(record).await?;

        for (category, vector) in vectors {
            let indexed = with_retry(self.config.retry, "index_embedding", || {
                self.index.index(id, *category, StoreScope::Scratch, vector)
            })
            .await;

            if let Err(e) = indexed {
                tracing::warn!(id, category = %category, error = %e, "Indexing failed, removing saved step");
                self.index
                    .delete_by_record_ids(&[id], StoreScope::Scratch)
                    .await?;
                self.scratch.delete(&[id]).await?;
                return Err(e);
            }
        }

        tracing::debug!(id, parent_id = record.parent_id, level = record.level, "Saved step");
        Ok(id)
    }

    /// Stamp a terminal outcome on `id` and its ancestors
    pub async fn mark_outcome(
        &self,
        id: RecordId,
        status: FinalStatus,
        max_hops: Option<u32>,
    ) -> Result<Vec<RecordId>> {
        with_retry(self.config.retry, "mark_outcome", || {
            self.propagator.propagate_terminal(id, status, max_hops)
        })
        .await
    }

    /// Consolidate the scratch tree containing `id` into the archive
    pub async fn end_task(&self, id: RecordId) -> Result<Option<ConsolidationReport>> {
        with_retry(self.config.retry, "end_task", || self.consolidator.consolidate(id)).await
    }

    // ─── Retrieval ───

    /// Successful archived experience for a situation and goal, one entry per
    /// archived tree, ordered by tree number.
    ///
    /// A tree is reported when one of its successful records matches
    /// `status`; successful records in the same tree matching `goal` are
    /// attached to it.
    pub async fn search_archive(&self, status: &str, goal: &str) -> Result<Vec<ArchiveMatch>> {
        let retry = self.config.retry;
        let (status_vec, goal_vec) = futures::try_join!(
            embed_text(self.embedder.as_ref(), status, retry),
            embed_text(self.embedder.as_ref(), goal, retry),
        )?;

        let limit = self.config.search_limit;
        let status_hits = with_retry(retry, "query_status", || {
            self.index
                .query(&status_vec, FieldCategory::Status, limit, StoreScope::Archive)
        })
        .await?;
        let goal_hits = with_retry(retry, "query_goal", || {
            self.index
                .query(&goal_vec, FieldCategory::Goal, limit, StoreScope::Archive)
        })
        .await?;

        let mut ids: Vec<RecordId> = status_hits
            .iter()
            .chain(goal_hits.iter())
            .map(|hit| hit.record_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let records: HashMap<RecordId, MemoryRecord> = self
            .archive
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|r| r.final_status == FinalStatus::Success && r.tree_num.is_some())
            .map(|r| (r.id, r))
            .collect();

        let mut matches: BTreeMap<i64, ArchiveMatch> = BTreeMap::new();
        for hit in &status_hits {
            let Some(record) = records.get(&hit.record_id) else {
                continue;
            };
            let Some(tree_num) = record.tree_num else {
                continue;
            };

            match matches.get_mut(&tree_num) {
                Some(existing) if record.level < existing.status_hit.level => {
                    existing.status_hit = record.clone();
                }
                Some(_) => {}
                None => {
                    matches.insert(
                        tree_num,
                        ArchiveMatch {
                            tree_num,
                            status_hit: record.clone(),
                            goal_hits: Vec::new(),
                        },
                    );
                }
            }
        }

        for hit in &goal_hits {
            let Some(record) = records.get(&hit.record_id) else {
                continue;
            };
            let Some(entry) = record.tree_num.and_then(|t| matches.get_mut(&t)) else {
                continue;
            };
            if !entry.goal_hits.iter().any(|r| r.id == record.id) {
                entry.goal_hits.push(record.clone());
            }
        }

        tracing::debug!(
            status_hits = status_hits.len(),
            goal_hits = goal_hits.len(),
            trees = matches.len(),
            "Searched archive"
        );
        Ok(matches.into_values().collect())
    }

    pub async fn load(&self, id: RecordId, scope: StoreScope) -> Result<Option<MemoryRecord>> {
        match scope {
            StoreScope::Scratch => self.scratch.load(id).await,
            StoreScope::Archive => self.archive.load(id).await,
        }
    }

    /// Every record of the tree containing `id`, ordered by level then id
    pub async fn tree_snapshot(&self, id: RecordId, scope: StoreScope) -> Result<Vec<MemoryRecord>> {
        match scope {
            StoreScope::Scratch => tree_of(self.scratch.as_ref(), id).await,
            StoreScope::Archive => tree_of(self.archive.as_ref(), id).await,
        }
    }

    /// Ancestors of `id` root first, then `id`, then everything below it
    pub async fn single_path(&self, id: RecordId, scope: StoreScope) -> Result<Vec<MemoryRecord>> {
        match scope {
            StoreScope::Scratch => path_through(self.scratch.as_ref(), id).await,
            StoreScope::Archive => path_through(self.archive.as_ref(), id).await,
        }
    }

    /// All records of one consolidated tree
    pub async fn archived_tree(&self, tree_num: i64) -> Result<Vec<MemoryRecord>> {
        self.archive.get_tree(tree_num).await
    }

    /// Snapshot the scratch subtree under `root_id` for prioritization
    pub async fn priority_graph(&self, root_id: RecordId) -> Result<PriorityGraph> {
        PriorityGraph::build(self.scratch.as_ref(), root_id).await
    }

    // ─── Accessors ───

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn scratch(&self) -> &Arc<dyn RecordStore> {
        &self.scratch
    }

    pub fn archive(&self) -> &Arc<dyn ArchiveStore> {
        &self.archive
    }

    pub fn index(&self) -> &Arc<dyn EmbeddingIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }
}

async fn tree_of<S>(store: &S, id: RecordId) -> Result<Vec<MemoryRecord>>
where
    S: RecordStore + ?Sized,
{
    let root_id = store
        .get_root_id(id)
        .await?
        .ok_or_else(|| MemoryError::NotFound(format!("record {id} in {} store", store.scope())))?;
    let ids = store.get_descendant_ids(root_id).await?;
    store.load_many(&ids).await
}

async fn path_through<S>(store: &S, id: RecordId) -> Result<Vec<MemoryRecord>>
where
    S: RecordStore + ?Sized,
{
    let mut records = store.get_path(id).await?;
    let below: Vec<RecordId> = store
        .get_descendant_ids(id)
        .await?
        .into_iter()
        .filter(|&d| d != id)
        .collect();
    records.extend(store.load_many(&below).await?);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_step_embeds_every_field() {
        let memory = MomentumMemory::in_memory().await.unwrap();
        let root = memory
            .save_step(
                &NewRecord::root("Exceeding weight by 10 kilograms.")
                    .with_goal("Reduce weight of 10 kg.")
                    .with_action("Establish a weight loss plan."),
            )
            .await
            .unwrap();
        memory
            .save_step(&NewRecord::new(root, 2, "Plan established."))
            .await
            .unwrap();

        assert_eq!(memory.scratch().count().await.unwrap(), 2);
        assert_eq!(memory.index().count(StoreScope::Scratch).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn save_step_rejects_broken_lineage_without_leftovers() {
        let memory = MomentumMemory::in_memory().await.unwrap();
        let root = memory.save_step(&NewRecord::root("S0")).await.unwrap();

        assert!(matches!(
            memory.save_step(&NewRecord::new(root, 3, "skip")).await,
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            memory.save_step(&NewRecord::new(root + 50, 2, "lost")).await,
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            memory.save_step(&NewRecord::new(ROOT_PARENT, 2, "bad root")).await,
            Err(MemoryError::Validation(_))
        ));

        assert_eq!(memory.scratch().count().await.unwrap(), 1);
        assert_eq!(memory.index().count(StoreScope::Scratch).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn single_path_and_tree_snapshot() {
        let memory = MomentumMemory::in_memory().await.unwrap();
        let root = memory.save_step(&NewRecord::root("S0")).await.unwrap();
        let a = memory.save_step(&NewRecord::new(root, 2, "a")).await.unwrap();
        let b = memory.save_step(&NewRecord::new(root, 2, "b")).await.unwrap();
        let a1 = memory.save_step(&NewRecord::new(a, 3, "a1")).await.unwrap();

        let path: Vec<_> = memory
            .single_path(a, StoreScope::Scratch)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(path, vec![root, a, a1]);

        let tree: Vec<_> = memory
            .tree_snapshot(a1, StoreScope::Scratch)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(tree, vec![root, a, b, a1]);

        assert!(matches!(
            memory.tree_snapshot(9999, StoreScope::Scratch).await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_rejected() {
        let memory = MomentumMemory::in_memory().await.unwrap();
        let result = memory.with_embedder(Arc::new(HashEmbeddingProvider::new(16)));
        assert!(matches!(result, Err(MemoryError::Configuration(_))));
    }

    #[tokio::test]
    async fn open_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfigBuilder::new()
            .data_dir(dir.path())
            .embedding_dimension(32)
            .build()
            .unwrap();

        let root = {
            let memory = MomentumMemory::open(config.clone()).await.unwrap();
            memory.save_step(&NewRecord::root("persisted")).await.unwrap()
        };

        let memory = MomentumMemory::open(config).await.unwrap();
        let record = memory.load(root, StoreScope::Scratch).await.unwrap().unwrap();
        assert_eq!(record.status, "persisted");
        assert_eq!(memory.index().count(StoreScope::Scratch).await.unwrap(), 4);
    }
}
