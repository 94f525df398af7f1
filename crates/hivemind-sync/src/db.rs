//! Postgres access layer.
//!
//! A thin wrapper over a [`PgPool`], injected into every component at
//! construction. Components issue their own queries against the pool;
//! this module only owns the concerns that cut across all of them:
//! connecting, first-run schema bootstrap, and the scoped work-mem
//! raise used around heavyweight DDL.

use std::time::Instant;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{Error, Result};

/// Embedded relational schema, applied on first run. Stored-procedure
/// bodies are installed separately and are invoked by name only.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Shared database handle.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    max_connections: u32,
}

impl Db {
    /// Connect to the store with a bounded connection pool.
    ///
    /// The pool bound doubles as the worker-pool bound for the
    /// finalization scheduler: each task holds one connection for its
    /// full duration, so running more tasks than connections would
    /// only serialize them at the pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        tracing::info!("Connected to store (pool size {})", max_connections);
        Ok(Self { pool, max_connections })
    }

    /// Like [`Db::connect`], but defers the first connection until a
    /// query is issued. Used where a handle is needed before the
    /// store is reachable.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)?;
        Ok(Self { pool, max_connections })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Maximum usable connections; bounds the finalization worker pool.
    pub fn max_connections(&self) -> usize {
        self.max_connections as usize
    }

    /// Check whether the schema has been loaded yet.
    pub async fn is_schema_loaded(&self) -> Result<bool> {
        let row: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM pg_catalog.pg_tables WHERE schemaname = 'public' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Apply the embedded schema, statement by statement.
    pub async fn load_schema(&self) -> Result<()> {
        for statement in schema_statements(SCHEMA_SQL) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Read the database-level working-memory budget.
    pub async fn work_mem(&self) -> Result<String> {
        let value: String = sqlx::query_scalar("SHOW work_mem").fetch_one(&self.pool).await?;
        Ok(value)
    }

    /// Set the database-level working-memory budget, returning the
    /// prior value so the caller can restore it.
    pub async fn set_work_mem(&self, value: &str) -> Result<String> {
        let prior = self.work_mem().await?;
        let sql = format!(
            r#"DO $$ BEGIN EXECUTE 'ALTER DATABASE '||current_database()||' SET work_mem TO "{}"'; END $$;"#,
            value
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(prior)
    }

    /// Execute a heavyweight statement (index build, `VACUUM`, stored
    /// procedure) under a raised work-mem budget.
    ///
    /// The prior budget is restored on all exit paths, including when
    /// the statement itself fails.
    pub async fn execute_heavy(&self, sql: &str, work_mem: &str) -> Result<()> {
        let start = Instant::now();
        let prior = self.set_work_mem(work_mem).await?;
        tracing::info!("[INIT] Attempting to execute query: `{}'...", sql);

        let result = sqlx::query(sql).execute(&self.pool).await;
        let restore = self.set_work_mem(&prior).await;

        result?;
        restore?;
        tracing::info!(
            "[INIT] Query `{}' done in {:.4}s",
            sql,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

/// Split an SQL file into executable statements, skipping comments
/// and whitespace.
fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}
