//! Record lineage storage using SQLite

use crate::error::{MemoryError, Result};
use crate::storage_backend::{ArchiveStore, RecordStore};
use crate::types::{
    FinalStatus, LeafInfo, MemoryRecord, MigratedRecord, NewRecord, RecordId, StoreScope,
    ROOT_PARENT,
};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const RECORD_COLUMNS: &str = "id, parent_id, level, status, goal, action, feedback, \
                              created_at, final_status, tree_num, source_id";

const CHAIN_COLUMNS: &str = "t.id, t.parent_id, t.level, t.status, t.goal, t.action, \
                             t.feedback, t.created_at, t.final_status, t.tree_num, t.source_id";

/// Open (creating if needed) the SQLite database at `path` and run migrations
pub async fn connect(path: impl AsRef<Path>, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!(path = %path.as_ref().display(), "Opened momentum database");

    Ok(pool)
}

/// Single-connection in-memory database, mostly for tests
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .create_if_missing(true);

    // The database lives exactly as long as its one connection.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Scratch or archive record store backed by one SQLite table
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    scope: StoreScope,
    max_hops: u32,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("scope", &self.scope)
            .field("max_hops", &self.max_hops)
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteRecordStore {
    /// Create a store over `scope`'s table. `max_hops` bounds every walk
    /// toward a root.
    pub fn new(pool: SqlitePool, scope: StoreScope, max_hops: u32) -> Arc<Self> {
        Arc::new(Self {
            pool,
            scope,
            max_hops: max_hops.max(1),
        })
    }

    pub fn scratch(pool: SqlitePool, max_hops: u32) -> Arc<Self> {
        Self::new(pool, StoreScope::Scratch, max_hops)
    }

    pub fn archive(pool: SqlitePool, max_hops: u32) -> Arc<Self> {
        Self::new(pool, StoreScope::Archive, max_hops)
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table(&self) -> &'static str {
        self.scope.table()
    }

    /// `id` and up to `max_rows - 1` ancestors, leaf first
    async fn walk_up(&self, id: RecordId, max_rows: u32) -> Result<Vec<MemoryRecord>> {
        let table = self.table();
        let sql = format!(
            r#"
            WITH RECURSIVE chain AS (
                SELECT {RECORD_COLUMNS}, 0 AS depth FROM {table} WHERE id = ?
                UNION ALL
                SELECT {CHAIN_COLUMNS}, c.depth + 1 FROM {table} t
                JOIN chain c ON t.id = c.parent_id
                WHERE c.depth + 1 < ?
            )
            SELECT {RECORD_COLUMNS} FROM chain ORDER BY depth
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(id)
            .bind(i64::from(max_rows))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Walk to the root, failing if the chain is broken or too long
    async fn walk_to_root(&self, id: RecordId) -> Result<Vec<MemoryRecord>> {
        let chain = self.walk_up(id, self.max_hops.saturating_add(1)).await?;
        match chain.last() {
            None => Ok(chain),
            Some(last) if last.is_root() => Ok(chain),
            Some(_) => Err(MemoryError::OrphanedRecord {
                id,
                hops: (chain.len() - 1) as u32,
            }),
        }
    }

    fn ensure_archive(&self) -> Result<()> {
        if self.scope != StoreScope::Archive {
            return Err(MemoryError::InvalidOperation(format!(
                "archive operation on {} store",
                self.scope
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn scope(&self) -> StoreScope {
        self.scope
    }

    async fn save(&self, record: &NewRecord) -> Result<RecordId> {
        record.validate_shape()?;

        // Parent check and insert in one statement so the lineage invariant
        // cannot be raced.
        let table = self.table();
        let sql = format!(
            r#"
            INSERT INTO {table} (
                parent_id, level, status, goal, action, feedback, created_at, final_status
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE ? = {ROOT_PARENT}
               OR EXISTS (SELECT 1 FROM {table} WHERE id = ? AND level = ? - 1)
            "#
        );

        let result = sqlx::query(&sql)
            .bind(record.parent_id)
            .bind(record.level)
            .bind(&record.status)
            .bind(&record.goal)
            .bind(&record.action)
            .bind(&record.feedback)
            .bind(chrono::Utc::now())
            .bind(record.final_status.as_str())
            .bind(record.parent_id)
            .bind(record.parent_id)
            .bind(record.level)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(match self.load(record.parent_id).await? {
                None => MemoryError::Validation(format!(
                    "parent {} does not exist in {} store",
                    record.parent_id, self.scope
                )),
                Some(parent) => MemoryError::Validation(format!(
                    "level {} does not follow parent {} at level {}",
                    record.level, parent.id, parent.level
                )),
            });
        }

        let id = result.last_insert_rowid();
        tracing::debug!(scope = %self.scope, id, parent_id = record.parent_id, level = record.level, "Saved record");
        Ok(id)
    }

    async fn load(&self, id: RecordId) -> Result<Option<MemoryRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?", self.table());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn load_many(&self, ids: &[RecordId]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE id IN ({}) ORDER BY level, id",
            self.table(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get_child_ids(&self, id: RecordId) -> Result<Vec<RecordId>> {
        let sql = format!(
            "SELECT id FROM {} WHERE parent_id = ? ORDER BY id",
            self.table()
        );
        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn get_descendant_ids(&self, root_id: RecordId) -> Result<Vec<RecordId>> {
        let table = self.table();
        let sql = format!(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM {table} WHERE id = ?
                UNION
                SELECT t.id FROM {table} t JOIN subtree s ON t.parent_id = s.id
            )
            SELECT id FROM subtree ORDER BY id
            "#
        );

        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(root_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn get_ancestor_chain(
        &self,
        id: RecordId,
        max_hops: Option<u32>,
    ) -> Result<Vec<MemoryRecord>> {
        match max_hops {
            Some(0) => Err(MemoryError::InvalidLimit(
                "max_hops must be at least 1".into(),
            )),
            Some(hops) => self.walk_up(id, hops).await,
            None => self.walk_to_root(id).await,
        }
    }

    async fn get_path(&self, id: RecordId) -> Result<Vec<MemoryRecord>> {
        let mut chain = self.walk_to_root(id).await?;
        if chain.is_empty() {
            return Err(MemoryError::NotFound(format!(
                "record {id} in {} store",
                self.scope
            )));
        }
        chain.reverse();
        Ok(chain)
    }

    async fn get_root_id(&self, id: RecordId) -> Result<Option<RecordId>> {
        let chain = self.walk_to_root(id).await?;
        Ok(chain.last().map(|root| root.id))
    }

    async fn get_leaves(&self, root_id: RecordId) -> Result<Vec<LeafInfo>> {
        let table = self.table();
        let sql = format!(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM {table} WHERE id = ?
                UNION
                SELECT t.id FROM {table} t JOIN subtree s ON t.parent_id = s.id
            )
            SELECT r.id, r.level, r.final_status FROM {table} r
            JOIN subtree s ON r.id = s.id
            WHERE NOT EXISTS (SELECT 1 FROM {table} c WHERE c.parent_id = r.id)
            ORDER BY r.level, r.id
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(root_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<LeafInfo> {
                let status: String = row.try_get("final_status")?;
                Ok(LeafInfo {
                    id: row.try_get("id")?,
                    level: row.try_get("level")?,
                    final_status: status.parse()?,
                })
            })
            .collect()
    }

    async fn set_final_status(&self, ids: &[RecordId], status: FinalStatus) -> Result<u64> {
        if !status.is_terminal() {
            return Err(MemoryError::InvalidStatus(format!(
                "'{status}' cannot be written as a final status"
            )));
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET final_status = ? WHERE id IN ({})",
            self.table(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(status.as_str());
        for id in ids {
            query = query.bind(id);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            self.table(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table());
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ArchiveStore for SqliteRecordStore {
    async fn find_migrated(&self, source_id: RecordId) -> Result<Option<MigratedRecord>> {
        self.ensure_archive()?;
        let row = sqlx::query("SELECT id, tree_num FROM long_term WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<MigratedRecord> {
            Ok(MigratedRecord {
                source_id,
                archive_id: row.try_get("id")?,
                tree_num: row.try_get::<Option<i64>, _>("tree_num")?.unwrap_or_default(),
            })
        })
        .transpose()
    }

    async fn insert_migrated(
        &self,
        record: &MemoryRecord,
        parent_id: RecordId,
        tree_num: Option<i64>,
    ) -> Result<MigratedRecord> {
        self.ensure_archive()?;

        // A fresh tree number is allocated inside the insert itself so two
        // concurrent sweeps can never pick the same one.
        let row = sqlx::query(
            r#"
            INSERT INTO long_term (
                parent_id, level, status, goal, action, feedback, created_at,
                final_status, tree_num, source_id
            )
            VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?,
                COALESCE(?, (SELECT COALESCE(MAX(tree_num), 0) + 1 FROM long_term)),
                ?
            )
            RETURNING id, tree_num
            "#,
        )
        .bind(parent_id)
        .bind(record.level)
        .bind(&record.status)
        .bind(&record.goal)
        .bind(&record.action)
        .bind(&record.feedback)
        .bind(record.created_at)
        .bind(record.final_status.as_str())
        .bind(tree_num)
        .bind(record.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MigratedRecord {
            source_id: record.id,
            archive_id: row.try_get("id")?,
            tree_num: row.try_get("tree_num")?,
        })
    }

    async fn get_tree(&self, tree_num: i64) -> Result<Vec<MemoryRecord>> {
        self.ensure_archive()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM long_term WHERE tree_num = ? ORDER BY level, id"
        );
        let rows = sqlx::query(&sql)
            .bind(tree_num)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Helper: Convert database row to MemoryRecord
fn row_to_record(row: &SqliteRow) -> Result<MemoryRecord> {
    let final_status: String = row.try_get("final_status")?;

    Ok(MemoryRecord {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        level: row.try_get("level")?,
        status: row.try_get("status")?,
        goal: row.try_get("goal")?,
        action: row.try_get("action")?,
        feedback: row.try_get("feedback")?,
        created_at: row.try_get("created_at")?,
        final_status: final_status.parse()?,
        tree_num: row.try_get("tree_num")?,
        source_id: row.try_get("source_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch() -> Arc<SqliteRecordStore> {
        let pool = connect_in_memory().await.unwrap();
        SqliteRecordStore::scratch(pool, 100)
    }

    /// root -> a -> (b, c), c -> d
    async fn sample_tree(store: &SqliteRecordStore) -> [RecordId; 5] {
        let root = store.save(&NewRecord::root("S0")).await.unwrap();
        let a = store.save(&NewRecord::new(root, 2, "S1")).await.unwrap();
        let b = store.save(&NewRecord::new(a, 3, "S2b")).await.unwrap();
        let c = store.save(&NewRecord::new(a, 3, "S2c")).await.unwrap();
        let d = store.save(&NewRecord::new(c, 4, "S3")).await.unwrap();
        [root, a, b, c, d]
    }

    #[tokio::test]
    async fn save_rejects_broken_lineage() {
        let store = scratch().await;
        let root = store.save(&NewRecord::root("start")).await.unwrap();

        let missing_parent = store.save(&NewRecord::new(root + 100, 2, "x")).await;
        assert!(matches!(missing_parent, Err(MemoryError::Validation(_))));

        let wrong_level = store.save(&NewRecord::new(root, 3, "x")).await;
        assert!(matches!(wrong_level, Err(MemoryError::Validation(_))));

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn saved_record_round_trips() {
        let store = scratch().await;
        let id = store
            .save(
                &NewRecord::root("Exceeding weight by 10 kilograms.")
                    .with_goal("Reduce weight of 10 kg.")
                    .with_action("Establish a weight loss plan.")
                    .with_feedback("First step."),
            )
            .await
            .unwrap();

        let record = store.load(id).await.unwrap().unwrap();
        assert_eq!(record.parent_id, ROOT_PARENT);
        assert_eq!(record.level, 1);
        assert_eq!(record.goal, "Reduce weight of 10 kg.");
        assert_eq!(record.final_status, FinalStatus::Pending);
        assert_eq!(record.tree_num, None);
    }

    #[tokio::test]
    async fn children_and_descendants() {
        let store = scratch().await;
        let [root, a, b, c, d] = sample_tree(&store).await;

        assert_eq!(store.get_child_ids(a).await.unwrap(), vec![b, c]);
        assert!(store.get_child_ids(d).await.unwrap().is_empty());

        let mut all = vec![root, a, b, c, d];
        all.sort();
        assert_eq!(store.get_descendant_ids(root).await.unwrap(), all);
        assert_eq!(store.get_descendant_ids(c).await.unwrap(), vec![c, d]);
        assert!(store.get_descendant_ids(9999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ancestor_chain_is_leaf_first_and_path_root_first() {
        let store = scratch().await;
        let [root, a, _, c, d] = sample_tree(&store).await;

        let chain: Vec<_> = store
            .get_ancestor_chain(d, None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(chain, vec![d, c, a, root]);

        let bounded: Vec<_> = store
            .get_ancestor_chain(d, Some(2))
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(bounded, vec![d, c]);

        let path: Vec<_> = store
            .get_path(d)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(path, vec![root, a, c, d]);

        assert!(matches!(
            store.get_ancestor_chain(d, Some(0)).await,
            Err(MemoryError::InvalidLimit(_))
        ));
    }

    #[tokio::test]
    async fn root_lookup() {
        let store = scratch().await;
        let [root, _, b, _, d] = sample_tree(&store).await;

        assert_eq!(store.get_root_id(d).await.unwrap(), Some(root));
        assert_eq!(store.get_root_id(b).await.unwrap(), Some(root));
        assert_eq!(store.get_root_id(root).await.unwrap(), Some(root));
        assert_eq!(store.get_root_id(4242).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dangling_parent_and_cycles_are_orphans() {
        let store = scratch().await;
        let now = chrono::Utc::now();

        for (id, parent) in [(500_i64, 999_i64), (600, 601), (601, 600)] {
            sqlx::query(
                "INSERT INTO short_term (id, parent_id, level, status, created_at) VALUES (?, ?, 2, 'x', ?)",
            )
            .bind(id)
            .bind(parent)
            .bind(now)
            .execute(store.pool())
            .await
            .unwrap();
        }

        assert!(matches!(
            store.get_root_id(500).await,
            Err(MemoryError::OrphanedRecord { id: 500, .. })
        ));
        assert!(matches!(
            store.get_root_id(600).await,
            Err(MemoryError::OrphanedRecord { id: 600, hops: 100 })
        ));
        assert!(matches!(
            store.get_path(601).await,
            Err(MemoryError::OrphanedRecord { .. })
        ));
    }

    #[tokio::test]
    async fn leaves_ordered_by_level_then_id() {
        let store = scratch().await;
        let [root, _, b, _, d] = sample_tree(&store).await;
        store
            .set_final_status(&[d], FinalStatus::Success)
            .await
            .unwrap();

        let leaves = store.get_leaves(root).await.unwrap();
        assert_eq!(
            leaves,
            vec![
                LeafInfo { id: b, level: 3, final_status: FinalStatus::Pending },
                LeafInfo { id: d, level: 4, final_status: FinalStatus::Success },
            ]
        );

        let lone = store.save(&NewRecord::root("alone")).await.unwrap();
        let lone_leaves = store.get_leaves(lone).await.unwrap();
        assert_eq!(lone_leaves.len(), 1);
        assert_eq!(lone_leaves[0].id, lone);
    }

    #[tokio::test]
    async fn final_status_batch_rejects_pending() {
        let store = scratch().await;
        let [root, a, ..] = sample_tree(&store).await;

        assert!(matches!(
            store.set_final_status(&[root], FinalStatus::Pending).await,
            Err(MemoryError::InvalidStatus(_))
        ));
        assert_eq!(
            store
                .set_final_status(&[root, a], FinalStatus::Fail)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store.load(a).await.unwrap().unwrap().final_status,
            FinalStatus::Fail
        );
    }

    #[tokio::test]
    async fn delete_ignores_missing_ids() {
        let store = scratch().await;
        let [_, _, b, c, d] = sample_tree(&store).await;

        assert_eq!(store.delete(&[d, b]).await.unwrap(), 2);
        assert_eq!(store.delete(&[d, b]).await.unwrap(), 0);
        assert_eq!(store.delete(&[]).await.unwrap(), 0);
        assert!(store.load(c).await.unwrap().is_some());
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn archive_insert_allocates_tree_numbers() {
        let pool = connect_in_memory().await.unwrap();
        let scratch = SqliteRecordStore::scratch(pool.clone(), 100);
        let archive = SqliteRecordStore::archive(pool, 100);

        let root = scratch.save(&NewRecord::root("S0")).await.unwrap();
        let child = scratch.save(&NewRecord::new(root, 2, "S1")).await.unwrap();
        let root_rec = scratch.load(root).await.unwrap().unwrap();
        let child_rec = scratch.load(child).await.unwrap().unwrap();

        assert_eq!(archive.count().await.unwrap(), 0);

        let first = archive
            .insert_migrated(&root_rec, ROOT_PARENT, None)
            .await
            .unwrap();
        assert_eq!(first.tree_num, 1);
        assert_eq!(first.source_id, root);

        let second = archive
            .insert_migrated(&child_rec, first.archive_id, Some(first.tree_num))
            .await
            .unwrap();
        assert_eq!(second.tree_num, 1);
        assert_eq!(archive.find_migrated(child).await.unwrap(), Some(second));
        assert_eq!(archive.find_migrated(9999).await.unwrap(), None);

        let tree = archive.get_tree(1).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[1].parent_id, first.archive_id);
        assert_eq!(tree[1].created_at, child_rec.created_at);

        assert!(matches!(
            scratch.get_tree(1).await,
            Err(MemoryError::InvalidOperation(_))
        ));
    }
}
