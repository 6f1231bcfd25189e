//! Scratch-to-archive consolidation
//!
//! A sweep copies every record of one scratch tree into the archive under
//! fresh ids, re-keys its vectors, and only then deletes the scratch rows.
//! The two stores share no transaction; instead every archive row records
//! the scratch id it came from, so a sweep that dies half way is finished by
//! running it again.

use crate::error::{MemoryError, Result};
use crate::storage_backend::{ArchiveStore, RecordStore};
use crate::types::{LeafInfo, RecordId, StoreScope, ROOT_PARENT};
use crate::vector_backend::EmbeddingIndex;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Advisory per-root locks. Sweeps and saves under the same root are
/// serialized; different roots proceed concurrently.
#[derive(Clone, Default)]
pub struct RootLocks {
    slots: Arc<Mutex<HashMap<RecordId, Arc<Mutex<()>>>>>,
}

impl RootLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and hold the lock on `root_id`
    pub async fn lock(&self, root_id: RecordId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(root_id).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Drop the slot for `root_id` unless someone holds or waits on it
    pub async fn forget_if_idle(&self, root_id: RecordId) {
        let mut slots = self.slots.lock().await;
        if slots
            .get(&root_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&root_id);
        }
    }

    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl std::fmt::Debug for RootLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootLocks").finish_non_exhaustive()
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Scratch root that was swept
    pub root_id: RecordId,
    /// Archive tree the records landed in
    pub tree_num: Option<i64>,
    /// Leaves enumerated under the root
    pub leaves: usize,
    /// Scratch id to archive id
    pub id_map: BTreeMap<RecordId, RecordId>,
    /// Records found already archived by an interrupted sweep
    pub reconciled: usize,
    /// Scratch rows deleted
    pub deleted: u64,
}

/// Order leaves for migration: success, then fail, then pending; shallower
/// first within a group; ascending id on ties.
pub fn order_leaves(leaves: &mut [LeafInfo]) {
    leaves.sort_by_key(|leaf| (leaf.final_status.consolidation_rank(), leaf.level, leaf.id));
}

pub struct ConsolidationEngine {
    scratch: Arc<dyn RecordStore>,
    archive: Arc<dyn ArchiveStore>,
    index: Arc<dyn EmbeddingIndex>,
    locks: RootLocks,
}

impl ConsolidationEngine {
    pub fn new(
        scratch: Arc<dyn RecordStore>,
        archive: Arc<dyn ArchiveStore>,
        index: Arc<dyn EmbeddingIndex>,
        locks: RootLocks,
    ) -> Self {
        Self {
            scratch,
            archive,
            index,
            locks,
        }
    }

    pub fn locks(&self) -> &RootLocks {
        &self.locks
    }

    /// Move the whole scratch tree containing `id` into the archive.
    ///
    /// Returns `None` when `id` is not in the scratch store (nothing to do,
    /// including a tree that was already consolidated).
    pub async fn consolidate(&self, id: RecordId) -> Result<Option<ConsolidationReport>> {
        let Some(root_id) = self.scratch.get_root_id(id).await? else {
            tracing::debug!(id, "Nothing to consolidate");
            return Ok(None);
        };

        let guard = self.locks.lock(root_id).await;
        let result = self.sweep(root_id).await;
        drop(guard);
        self.locks.forget_if_idle(root_id).await;

        result
    }

    async fn sweep(&self, root_id: RecordId) -> Result<Option<ConsolidationReport>> {
        // A concurrent sweep may have finished this root while we waited.
        let mut leaves = self.scratch.get_leaves(root_id).await?;
        if leaves.is_empty() {
            return Ok(None);
        }
        order_leaves(&mut leaves);

        let mut id_map: BTreeMap<RecordId, RecordId> = BTreeMap::new();
        let mut migrated: Vec<RecordId> = Vec::new();
        let mut tree_num: Option<i64> = None;
        let mut reconciled = 0;

        for leaf in &leaves {
            let path = self.scratch.get_path(leaf.id).await?;

            for node in &path {
                if id_map.contains_key(&node.id) {
                    continue;
                }

                let parent_id = if node.is_root() {
                    ROOT_PARENT
                } else {
                    *id_map.get(&node.parent_id).ok_or_else(|| {
                        MemoryError::InvalidOperation(format!(
                            "parent {} of record {} was not migrated before it",
                            node.parent_id, node.id
                        ))
                    })?
                };

                let placed = match self.archive.find_migrated(node.id).await? {
                    Some(existing) => {
                        tracing::warn!(
                            root_id,
                            scratch_id = node.id,
                            archive_id = existing.archive_id,
                            "Record already archived by an interrupted sweep, reconciling"
                        );
                        reconciled += 1;
                        existing
                    }
                    None => {
                        self.archive
                            .insert_migrated(node, parent_id, tree_num)
                            .await?
                    }
                };
                let current_tree = *tree_num.get_or_insert(placed.tree_num);

                let moved = self
                    .index
                    .move_by_record_id(node.id, placed.archive_id, StoreScope::Scratch, StoreScope::Archive)
                    .await?;

                tracing::debug!(
                    root_id,
                    tree_num = current_tree,
                    scratch_id = node.id,
                    archive_id = placed.archive_id,
                    moved,
                    "Migrated record"
                );

                id_map.insert(node.id, placed.archive_id);
                migrated.push(node.id);
            }
        }

        self.index
            .delete_by_record_ids(&migrated, StoreScope::Scratch)
            .await?;
        let deleted = self.scratch.delete(&migrated).await?;

        tracing::info!(
            root_id,
            tree_num,
            leaves = leaves.len(),
            migrated = migrated.len(),
            reconciled,
            deleted,
            "Consolidated scratch tree"
        );

        Ok(Some(ConsolidationReport {
            root_id,
            tree_num,
            leaves: leaves.len(),
            id_map,
            reconciled,
            deleted,
        }))
    }
}
