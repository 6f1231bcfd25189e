//! Terminal outcome propagation up a scratch tree

use crate::error::{MemoryError, Result};
use crate::storage_backend::RecordStore;
use crate::types::{FinalStatus, RecordId};
use std::sync::Arc;

/// Marks a leaf and every ancestor with the leaf's terminal outcome
#[derive(Clone)]
pub struct StatusPropagator {
    store: Arc<dyn RecordStore>,
}

impl StatusPropagator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Stamp `status` on `leaf_id` and its ancestors, at most `max_hops`
    /// records in total (`None` walks to the root). Returns the updated ids,
    /// leaf first.
    ///
    /// Ancestors already holding a terminal status are overwritten, so the
    /// most recent outcome wins.
    pub async fn propagate_terminal(
        &self,
        leaf_id: RecordId,
        status: FinalStatus,
        max_hops: Option<u32>,
    ) -> Result<Vec<RecordId>> {
        if !status.is_terminal() {
            return Err(MemoryError::InvalidStatus(format!(
                "'{status}' is not a terminal outcome"
            )));
        }

        let chain = self.store.get_ancestor_chain(leaf_id, max_hops).await?;
        if chain.is_empty() {
            return Err(MemoryError::NotFound(format!("record {leaf_id}")));
        }

        let ids: Vec<RecordId> = chain.iter().map(|r| r.id).collect();
        let overwritten = chain
            .iter()
            .filter(|r| r.final_status.is_terminal() && r.final_status != status)
            .count();
        if overwritten > 0 {
            tracing::debug!(leaf_id, %status, overwritten, "Overwriting earlier terminal outcomes");
        }

        let updated = self.store.set_final_status(&ids, status).await?;
        tracing::info!(leaf_id, %status, updated, "Propagated final status");

        Ok(ids)
    }
}
