//! Turso-backed checkpoint store.
//!
//! Architecture:
//!   - Database file: .hxo/checkpoints.db (configurable)
//!   - WAL mode: readers (status queries) never block the coordinator
//!   - Schema: plans, shards, results tables
//!   - Rows carry the full JSON record plus the columns needed for queries
//!     (status, stage, phase, sequence)

use async_trait::async_trait;
use hxo_core::{HxoError, HxoPlan, ShardResult, ShardSpec};
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;
use turso::{params, Builder, Connection};

use crate::checkpointer::Checkpointer;

const UPSERT_PLAN: &str = r#"
    INSERT INTO plans (plan_id, name, status, plan_json, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(plan_id) DO UPDATE SET
        name = excluded.name,
        status = excluded.status,
        plan_json = excluded.plan_json,
        updated_at = excluded.updated_at
"#;

const UPSERT_SHARD: &str = r#"
    INSERT INTO shards (plan_id, shard_id, stage_id, phase, seq, shard_json, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(plan_id, shard_id) DO UPDATE SET
        stage_id = excluded.stage_id,
        phase = excluded.phase,
        seq = excluded.seq,
        shard_json = excluded.shard_json,
        updated_at = excluded.updated_at
"#;

const DELETE_SHARD: &str = "DELETE FROM shards WHERE plan_id = ? AND shard_id = ?";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("turso error: {0}")]
    Turso(#[from] turso::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for HxoError {
    fn from(err: StorageError) -> Self {
        HxoError::CheckpointIo(err.to_string())
    }
}

/// Checkpointer persisting to an embedded Turso database
///
/// Writes are serialized through one connection so upserts for the same
/// (plan, shard) key apply in call order.
pub struct TursoCheckpointer {
    conn: Mutex<Connection>,
    path: String,
}

impl TursoCheckpointer {
    /// Open (or create) the store at `path` and make sure the schema exists.
    ///
    /// ```no_run
    /// use hxo_storage::TursoCheckpointer;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = TursoCheckpointer::open(".hxo/checkpoints.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        // PRAGMA statements may return rows, so use query()
        let _ = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
        let _ = conn.query("PRAGMA busy_timeout=5000", params![]).await?;

        let store = TursoCheckpointer {
            conn: Mutex::new(conn),
            path: path_str,
        };
        store.init_schema().await?;
        debug!("Opened checkpoint store at {}", store.path);
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create tables and indexes. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = vec![
            r#"CREATE TABLE IF NOT EXISTS plans (
                plan_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                plan_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS shards (
                plan_id TEXT NOT NULL,
                shard_id TEXT NOT NULL,
                stage_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                seq INTEGER NOT NULL,
                shard_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (plan_id, shard_id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS results (
                plan_id TEXT NOT NULL,
                shard_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                output_hash TEXT NOT NULL,
                result_json TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                PRIMARY KEY (plan_id, shard_id)
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_plans_status ON plans(status)",
            "CREATE INDEX IF NOT EXISTS idx_shards_stage ON shards(plan_id, stage_id)",
            "CREATE INDEX IF NOT EXISTS idx_shards_phase ON shards(plan_id, phase)",
            "CREATE INDEX IF NOT EXISTS idx_shards_seq ON shards(plan_id, seq)",
        ];

        let conn = self.conn.lock().await;
        for stmt in statements {
            conn.execute(stmt, params![]).await?;
        }
        Ok(())
    }

    fn plan_args(plan: &HxoPlan) -> Result<Vec<turso::Value>> {
        Ok(vec![
            plan.id.clone().into(),
            plan.name.clone().into(),
            plan.status.as_str().to_string().into(),
            serde_json::to_string(plan)?.into(),
            plan.created_at.to_rfc3339().into(),
            plan.updated_at.to_rfc3339().into(),
        ])
    }

    fn shard_args(shard: &ShardSpec) -> Result<Vec<turso::Value>> {
        Ok(vec![
            shard.plan_id.clone().into(),
            shard.shard_id.clone().into(),
            shard.stage_id.clone().into(),
            shard.phase.as_str().to_string().into(),
            (shard.seq as i64).into(),
            serde_json::to_string(shard)?.into(),
            shard.updated_at.to_rfc3339().into(),
        ])
    }

    /// Decode the JSON column (index 0) of every row
    async fn query_json<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        args: Vec<turso::Value>,
    ) -> Result<Vec<T>> {
        let mut rows = conn.query(sql, args).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let json: String = row.get(0)?;
            let record = serde_json::from_str(&json)
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", e, json)))?;
            out.push(record);
        }
        Ok(out)
    }

    async fn swap_shards(
        &self,
        plan: &HxoPlan,
        removed: &[String],
        added: &[ShardSpec],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().await?;
        for id in removed {
            tx.execute(DELETE_SHARD, params![plan.id.clone(), id.clone()])
                .await?;
        }
        for shard in added {
            tx.execute(UPSERT_SHARD, Self::shard_args(shard)?).await?;
        }
        tx.execute(UPSERT_PLAN, Self::plan_args(plan)?).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_shard_and_plan(&self, plan: &HxoPlan, shard: &ShardSpec) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().await?;
        tx.execute(UPSERT_SHARD, Self::shard_args(shard)?).await?;
        tx.execute(UPSERT_PLAN, Self::plan_args(plan)?).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_shards(&self, shards: &[ShardSpec]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().await?;
        for shard in shards {
            tx.execute(UPSERT_SHARD, Self::shard_args(shard)?).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_result(&self, result: &ShardResult) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO results (plan_id, shard_id, success, output_hash, result_json, finished_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(plan_id, shard_id) DO NOTHING"#,
            params![
                result.plan_id.clone(),
                result.shard_id.clone(),
                result.success as i64,
                result.output_hash.clone(),
                result_json,
                result.finished_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Shard counts per phase for a plan, read straight from the rows
    pub async fn phase_counts(&self, plan_id: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT phase, COUNT(*) FROM shards WHERE plan_id = ? GROUP BY phase ORDER BY phase",
                params![plan_id],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let phase: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            out.push((phase, count));
        }
        Ok(out)
    }
}

#[async_trait]
impl Checkpointer for TursoCheckpointer {
    async fn save_plan(&self, plan: &HxoPlan) -> hxo_core::Result<()> {
        let args = Self::plan_args(plan)?;
        let conn = self.conn.lock().await;
        conn.execute(UPSERT_PLAN, args)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn load_plan(&self, plan_id: &str) -> hxo_core::Result<Option<HxoPlan>> {
        let conn = self.conn.lock().await;
        let mut plans: Vec<HxoPlan> = Self::query_json(
            &conn,
            "SELECT plan_json FROM plans WHERE plan_id = ?",
            vec![plan_id.to_string().into()],
        )
        .await?;
        Ok(plans.pop())
    }

    async fn list_plans(&self) -> hxo_core::Result<Vec<HxoPlan>> {
        let conn = self.conn.lock().await;
        Ok(Self::query_json(
            &conn,
            "SELECT plan_json FROM plans ORDER BY created_at ASC",
            Vec::new(),
        )
        .await?)
    }

    async fn list_incomplete_plans(&self) -> hxo_core::Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"SELECT plan_id FROM plans
                   WHERE status NOT IN ('done', 'failed', 'aborted')
                   ORDER BY created_at ASC"#,
                params![],
            )
            .await
            .map_err(StorageError::from)?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(StorageError::from)? {
            let id: String = row.get(0).map_err(StorageError::from)?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn save_shard(&self, shard: &ShardSpec) -> hxo_core::Result<()> {
        let args = Self::shard_args(shard)?;
        let conn = self.conn.lock().await;
        conn.execute(UPSERT_SHARD, args)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn load_shard(&self, plan_id: &str, shard_id: &str) -> hxo_core::Result<Option<ShardSpec>> {
        let conn = self.conn.lock().await;
        let mut shards: Vec<ShardSpec> = Self::query_json(
            &conn,
            "SELECT shard_json FROM shards WHERE plan_id = ? AND shard_id = ?",
            vec![plan_id.to_string().into(), shard_id.to_string().into()],
        )
        .await?;
        Ok(shards.pop())
    }

    async fn list_shards(&self, plan_id: &str) -> hxo_core::Result<Vec<ShardSpec>> {
        let conn = self.conn.lock().await;
        Ok(Self::query_json(
            &conn,
            "SELECT shard_json FROM shards WHERE plan_id = ? ORDER BY seq ASC, shard_id ASC",
            vec![plan_id.to_string().into()],
        )
        .await?)
    }

    async fn save_result(&self, result: &ShardResult) -> hxo_core::Result<()> {
        Ok(self.insert_result(result).await?)
    }

    async fn load_result(
        &self,
        plan_id: &str,
        shard_id: &str,
    ) -> hxo_core::Result<Option<ShardResult>> {
        let conn = self.conn.lock().await;
        let mut results: Vec<ShardResult> = Self::query_json(
            &conn,
            "SELECT result_json FROM results WHERE plan_id = ? AND shard_id = ?",
            vec![plan_id.to_string().into(), shard_id.to_string().into()],
        )
        .await?;
        Ok(results.pop())
    }

    async fn list_results(&self, plan_id: &str) -> hxo_core::Result<Vec<ShardResult>> {
        let conn = self.conn.lock().await;
        Ok(Self::query_json(
            &conn,
            "SELECT result_json FROM results WHERE plan_id = ? ORDER BY shard_id ASC",
            vec![plan_id.to_string().into()],
        )
        .await?)
    }

    async fn replace_shards(
        &self,
        plan: &HxoPlan,
        removed: &[String],
        added: &[ShardSpec],
    ) -> hxo_core::Result<()> {
        Ok(self.swap_shards(plan, removed, added).await?)
    }

    async fn save_shards(&self, shards: &[ShardSpec]) -> hxo_core::Result<()> {
        Ok(self.write_shards(shards).await?)
    }

    async fn commit_shard(&self, plan: &HxoPlan, shard: &ShardSpec) -> hxo_core::Result<()> {
        Ok(self.write_shard_and_plan(plan, shard).await?)
    }

    async fn compact(&self) -> hxo_core::Result<()> {
        let conn = self.conn.lock().await;
        let _ = conn
            .query("PRAGMA wal_checkpoint(TRUNCATE)", params![])
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }
}
