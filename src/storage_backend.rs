//! Lineage store traits
//!
//! The engine talks to its relational stores only through these traits so
//! that SQLite can be swapped for another engine, or a test double.

use crate::error::Result;
use crate::types::{FinalStatus, LeafInfo, MemoryRecord, MigratedRecord, NewRecord, RecordId, StoreScope};
use async_trait::async_trait;

/// Parent-pointer record store with recursive lineage queries
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Which store this is
    fn scope(&self) -> StoreScope;

    /// Insert one record and return its new id. The parent must exist in
    /// this store at `level - 1`.
    async fn save(&self, record: &NewRecord) -> Result<RecordId>;

    async fn load(&self, id: RecordId) -> Result<Option<MemoryRecord>>;

    /// Load several records, ordered by level then id. Missing ids are skipped.
    async fn load_many(&self, ids: &[RecordId]) -> Result<Vec<MemoryRecord>>;

    /// Direct children, ascending id
    async fn get_child_ids(&self, id: RecordId) -> Result<Vec<RecordId>>;

    /// `root_id` and everything below it. Empty if `root_id` does not exist.
    async fn get_descendant_ids(&self, root_id: RecordId) -> Result<Vec<RecordId>>;

    /// `id` and up to `max_hops - 1` ancestors, leaf first. `None` walks to
    /// the root (bounded by the store's hop limit).
    async fn get_ancestor_chain(
        &self,
        id: RecordId,
        max_hops: Option<u32>,
    ) -> Result<Vec<MemoryRecord>>;

    /// Full root to `id` path, root first. Fails with `OrphanedRecord` if the
    /// chain does not end at a root.
    async fn get_path(&self, id: RecordId) -> Result<Vec<MemoryRecord>>;

    /// Root of the tree containing `id`, `None` if `id` does not exist.
    async fn get_root_id(&self, id: RecordId) -> Result<Option<RecordId>>;

    /// Childless records in the tree under `root_id` (root included)
    async fn get_leaves(&self, root_id: RecordId) -> Result<Vec<LeafInfo>>;

    /// Stamp a terminal status on all `ids` as one batch
    async fn set_final_status(&self, ids: &[RecordId], status: FinalStatus) -> Result<u64>;

    /// Bulk delete; ids already gone are ignored
    async fn delete(&self, ids: &[RecordId]) -> Result<u64>;

    async fn count(&self) -> Result<i64>;
}

/// Archive-only operations used by consolidation
#[async_trait]
pub trait ArchiveStore: RecordStore {
    /// Archive placement of a scratch record migrated earlier, if any
    async fn find_migrated(&self, source_id: RecordId) -> Result<Option<MigratedRecord>>;

    /// Insert a copy of a scratch record under `parent_id`. With
    /// `tree_num == None` a fresh tree number (current maximum + 1) is
    /// allocated atomically with the insert.
    async fn insert_migrated(
        &self,
        record: &MemoryRecord,
        parent_id: RecordId,
        tree_num: Option<i64>,
    ) -> Result<MigratedRecord>;

    /// All records of one consolidated tree, ordered by level then id
    async fn get_tree(&self, tree_num: i64) -> Result<Vec<MemoryRecord>>;
}
