// src/store/mod.rs

//! Persistent target store over SQLite.
//!
//! One row per target: the serialized target in a JSON `data` column, a
//! `version` counter for defensive conflict detection, and derived columns
//! (`alive`, `active`, `equivalence_key`) maintained on every write so that
//! the hot listings (`iter_alive`, `iter_active`, `find_equivalent`) are
//! index scans instead of full decodes.
//!
//! The engine is the single writer; `update` still takes a per-id lock and
//! checks the version on commit so that a misconfigured second engine
//! instance corrupts nothing. A conflict is retried once and then promoted
//! to a fatal error.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{OverseerError, Result};
use crate::target::{Target, TargetId};

/// SQLite-backed mapping `id -> Target`.
pub struct TargetStore {
    pool: SqlitePool,
    /// Per-id write locks; `update` is read-modify-write under the lock.
    locks: Mutex<HashMap<TargetId, Arc<Mutex<()>>>>,
}

impl TargetStore {
    /// Connect to the database named by `database_parameters`
    /// (e.g. `sqlite:./overseer.db` or `sqlite::memory:`) and run the
    /// schema migration.
    pub async fn connect(database_parameters: &str) -> Result<Self> {
        let path = database_parameters
            .strip_prefix("sqlite:")
            .unwrap_or(database_parameters);

        // An in-memory database exists per connection, so the pool must be
        // pinned to a single one.
        let pool = if path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(SqliteConnectOptions::new().in_memory(true))
                .await?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            SqlitePool::connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true),
            )
            .await?
        };
        let store = Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        };
        store.migrate().await?;
        info!(database = %database_parameters, "target store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS targets (
                id              TEXT    PRIMARY KEY,
                data            TEXT    NOT NULL,
                version         INTEGER NOT NULL,
                alive           INTEGER NOT NULL,
                active          INTEGER NOT NULL,
                equivalence_key TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS targets_alive ON targets (alive)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS targets_active ON targets (active)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS targets_equivalence ON targets (equivalence_key)
             WHERE equivalence_key IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fetch a target by id.
    pub async fn get(&self, id: &str) -> Result<Target> {
        let row = sqlx::query("SELECT data FROM targets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Err(OverseerError::NotFound(id.to_string())),
            Some(row) => {
                let data: String = row.get(0);
                Ok(serde_json::from_str(&data)?)
            }
        }
    }

    /// Idempotent upsert. New rows start at version 1; existing rows bump
    /// their version.
    pub async fn put(&self, target: &Target) -> Result<()> {
        let guard = self.lock_for(&target.id).await;
        let _held = guard.lock().await;

        let data = serde_json::to_string(target)?;
        sqlx::query(
            "INSERT INTO targets (id, data, version, alive, active, equivalence_key)
             VALUES (?, ?, 1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                version = targets.version + 1,
                alive = excluded.alive,
                active = excluded.active,
                equivalence_key = excluded.equivalence_key",
        )
        .bind(&target.id)
        .bind(&data)
        .bind(target.is_alive() as i64)
        .bind(target.is_active() as i64)
        .bind(target.equivalence_key())
        .execute(&self.pool)
        .await?;

        debug!(id = %target.id, state = target.state().tag(), "target stored");
        Ok(())
    }

    /// Read-modify-write under the per-id lock. `f` must be pure with
    /// respect to the target; side effects belong after the commit.
    ///
    /// Returns the committed target. A version conflict (some other writer
    /// slipped in despite the single-writer contract) is retried once; a
    /// second conflict is fatal.
    pub async fn update<F>(&self, id: &str, mut f: F) -> Result<Target>
    where
        F: FnMut(&mut Target),
    {
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;

        for attempt in 0..2 {
            let row = sqlx::query("SELECT data, version FROM targets WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| OverseerError::NotFound(id.to_string()))?;

            let data: String = row.get(0);
            let version: i64 = row.get(1);
            let mut target: Target = serde_json::from_str(&data)?;

            f(&mut target);

            let new_data = serde_json::to_string(&target)?;
            let result = sqlx::query(
                "UPDATE targets
                 SET data = ?, version = ?, alive = ?, active = ?, equivalence_key = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(&new_data)
            .bind(version + 1)
            .bind(target.is_alive() as i64)
            .bind(target.is_active() as i64)
            .bind(target.equivalence_key())
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(target);
            }
            if attempt == 0 {
                debug!(id, "store conflict; retrying once");
            }
        }

        Err(OverseerError::Fatal(format!(
            "repeated store conflict on target {id}; a second writer is running"
        )))
    }

    /// All non-terminal targets.
    pub async fn iter_alive(&self) -> Result<Vec<Target>> {
        self.list_where("alive = 1").await
    }

    /// All activated non-terminal targets (the driver's work universe).
    pub async fn iter_active(&self) -> Result<Vec<Target>> {
        self.list_where("active = 1").await
    }

    /// Every target, terminal ones included.
    pub async fn iter_all(&self) -> Result<Vec<Target>> {
        self.list_where("1 = 1").await
    }

    async fn list_where(&self, clause: &str) -> Result<Vec<Target>> {
        let query = format!("SELECT data FROM targets WHERE {clause} ORDER BY id");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get(0);
            out.push(serde_json::from_str::<Target>(&data)?);
        }
        Ok(out)
    }

    /// Find an alive target equivalent to `candidate` under the candidate's
    /// equivalence policy. The `equivalence_key` index narrows the scan to
    /// exact `(build_process, condition)` matches.
    pub async fn find_equivalent(&self, candidate: &Target) -> Result<Option<TargetId>> {
        let key = match candidate.equivalence_key() {
            None => return Ok(None),
            Some(k) => k,
        };

        let rows = sqlx::query(
            "SELECT data FROM targets
             WHERE alive = 1 AND equivalence_key = ?
             ORDER BY id",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let data: String = row.get(0);
            let existing: Target = serde_json::from_str(&data)?;
            if candidate.is_equivalent_to(&existing) {
                return Ok(Some(existing.id));
            }
        }
        Ok(None)
    }

    /// Gauge for the server status report.
    pub async fn count_alive(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE alive = 1),
                    COUNT(*) FILTER (WHERE active = 1)
             FROM targets",
        )
        .fetch_one(&self.pool)
        .await?;
        let alive: i64 = row.get(0);
        let active: i64 = row.get(1);
        Ok((alive as u64, active as u64))
    }
}
