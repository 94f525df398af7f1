//! Follow-count delta aggregation.
//!
//! During a sync window, follow/unfollow operations accumulate signed
//! deltas per `(account, counter role)` pair instead of touching
//! `hive_accounts` row by row. A flush groups the accumulated entries
//! by `(role, delta magnitude)` and issues one batched update per
//! group, so the statement count is bounded by the number of distinct
//! magnitudes rather than the number of affected accounts.
//!
//! The aggregator is single-writer: it is owned by the sync driver
//! and passed by reference into every indexer call. If parallel
//! ingestion is ever introduced it must funnel through one exclusive
//! critical section.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use metrics::counter;

use crate::db::Db;
use crate::Result;

/// Which derived counter on `hive_accounts` a delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterRole {
    Followers,
    Following,
}

impl CounterRole {
    /// The `hive_accounts` column this role maintains.
    pub fn column(self) -> &'static str {
        match self {
            CounterRole::Followers => "followers",
            CounterRole::Following => "following",
        }
    }
}

/// Ephemeral per-window counter deltas.
#[derive(Debug, Default)]
pub struct DeltaAggregator {
    followers: HashMap<i32, i64>,
    following: HashMap<i32, i64>,
}

impl DeltaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `direction` (±1) to the counter for `(account, role)`,
    /// creating it at zero if absent.
    pub fn apply(&mut self, account_id: i32, role: CounterRole, direction: i64) {
        let map = match role {
            CounterRole::Followers => &mut self.followers,
            CounterRole::Following => &mut self.following,
        };
        *map.entry(account_id).or_insert(0) += direction;
    }

    /// Whether any entries are buffered (including zero-net ones).
    pub fn is_empty(&self) -> bool {
        self.followers.is_empty() && self.following.is_empty()
    }

    /// Drain the aggregator into magnitude-grouped batches, clearing
    /// all internal state.
    ///
    /// Zero-net entries are dropped: applying them would be a no-op
    /// update, and skipping them preserves the algebraic sum.
    /// Account ids within a group are sorted for deterministic
    /// statements.
    pub fn take_grouped(&mut self) -> Vec<(CounterRole, i64, Vec<i32>)> {
        let followers = std::mem::take(&mut self.followers);
        let following = std::mem::take(&mut self.following);

        let mut out = Vec::new();
        for (role, deltas) in
            [(CounterRole::Followers, followers), (CounterRole::Following, following)]
        {
            let mut by_magnitude: BTreeMap<i64, Vec<i32>> = BTreeMap::new();
            for (account_id, delta) in deltas {
                if delta != 0 {
                    by_magnitude.entry(delta).or_default().push(account_id);
                }
            }
            for (magnitude, mut ids) in by_magnitude {
                ids.sort_unstable();
                out.push((role, magnitude, ids));
            }
        }
        out
    }

    /// Flush all pending deltas as grouped batched updates inside a
    /// single transaction.
    ///
    /// Returns the number of accounts updated; `0` with no database
    /// call when nothing is pending. All groups commit together: a
    /// failure mid-flush rolls back every update, so a replayed
    /// window re-applies the deltas exactly once.
    pub async fn flush(&mut self, db: &Db) -> Result<usize> {
        let groups = self.take_grouped();
        if groups.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let mut tx = db.pool().begin().await?;
        let updated = Self::execute_groups(&groups, &mut tx).await?;
        tx.commit().await?;

        counter!("follow_accounts_flushed_total").increment(updated as u64);
        tracing::info!(
            "[SYNC] flushed {} follow deltas in {:.4}s",
            updated,
            start.elapsed().as_secs_f64()
        );
        Ok(updated)
    }

    /// Issue the grouped updates on an existing connection, normally
    /// a transaction shared with the buffered-edge flush.
    pub(crate) async fn execute_groups(
        groups: &[(CounterRole, i64, Vec<i32>)],
        conn: &mut sqlx::PgConnection,
    ) -> Result<usize> {
        let mut updated = 0usize;
        for (role, magnitude, ids) in groups {
            let sql = format!(
                "UPDATE hive_accounts SET {col} = {col} + $1 WHERE id = ANY($2)",
                col = role.column()
            );
            sqlx::query(&sql)
                .bind(*magnitude)
                .bind(ids.as_slice())
                .execute(&mut *conn)
                .await?;
            updated += ids.len();
        }
        Ok(updated)
    }
}
