//! Follow operation indexing.
//!
//! `follow_op` validates and normalizes an incoming payload, resolves
//! account names to ids, then picks a write path from the engine's
//! sync mode: during initial sync edges are buffered in memory with
//! last-write-wins per `(follower, following)` key; during live sync
//! states 0–8 become immediate conflict-merging upserts and states
//! 9–14 become follower-scoped reset updates.
//!
//! Follow-count bookkeeping goes through the [`DeltaAggregator`]
//! owned by the sync driver; nothing here writes `hive_accounts`
//! directly.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use metrics::counter;
use serde_json::Value;
use sqlx::QueryBuilder;

use hivemind_core::{
    merge, EdgeFlags, FollowOperation, FollowState, ResetScope, DEFAULT_NOTIFY_SCORE,
    NULL_ACCOUNT,
};

use crate::db::Db;
use crate::deltas::{CounterRole, DeltaAggregator};
use crate::state::ModeHandle;
use crate::Result;

/// Notification type id for a new follow.
const NOTIFY_TYPE_FOLLOW: i16 = 15;

/// Rows per statement when draining the buffered-edge map.
const FLUSH_BATCH_SIZE: usize = 1000;

/// The conflict-merge policy in SQL form, used by the batched flush
/// path where no prior row was read. Mirrors
/// [`hivemind_core::merge`]: a buffered state of 0 never overwrites a
/// stored non-zero state, and each derived flag is forced only by its
/// own transition.
const FOLLOW_CONFLICT_CLAUSE: &str = r#" ON CONFLICT (follower, following) DO UPDATE SET
    state = (CASE EXCLUDED.state WHEN 0 THEN hf.state ELSE EXCLUDED.state END),
    blacklisted = (CASE EXCLUDED.state WHEN 3 THEN TRUE WHEN 5 THEN FALSE ELSE hf.blacklisted END),
    follow_blacklists = (CASE EXCLUDED.state WHEN 4 THEN TRUE WHEN 6 THEN FALSE ELSE hf.follow_blacklists END),
    follow_muted = (CASE EXCLUDED.state WHEN 7 THEN TRUE WHEN 8 THEN FALSE ELSE hf.follow_muted END)"#;

/// An edge held in memory during initial sync.
#[derive(Debug, Clone)]
struct BufferedEdge {
    follower: i32,
    following: i32,
    state: FollowState,
    at: NaiveDateTime,
}

/// Side effects of a live edge write, decided from the state
/// transition alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EdgeEffects {
    /// Apply a `+1` follow-count delta to both endpoints.
    follow_delta: bool,
    /// Apply a `-1` follow-count delta to both endpoints. Fires
    /// independently of `follow_delta`; a reaffirmed follow nets to
    /// zero.
    unfollow_delta: bool,
    /// Emit a new-follow notification.
    notify: bool,
}

/// The new state is what drives the increment; the decrement depends
/// only on what was stored before the write.
fn edge_effects(old_state: Option<i16>, new: FollowState) -> EdgeEffects {
    let became_follow = new.code() == 1;
    EdgeEffects {
        follow_delta: became_follow,
        unfollow_delta: old_state == Some(1),
        notify: became_follow && old_state.is_none(),
    }
}

/// The one or two follower-scoped updates a reset state maps to.
///
/// Each statement binds `$1` = follower id; sentinel statements also
/// bind `$2` = the reserved aggregate-marker account name.
fn reset_statements(scope: ResetScope) -> (&'static str, Option<&'static str>) {
    const SENTINEL_BLACKLISTS: &str = "UPDATE hive_follows SET follow_blacklists = true \
         WHERE follower = $1 AND following = (SELECT id FROM hive_accounts WHERE name = $2)";
    const SENTINEL_MUTED: &str = "UPDATE hive_follows SET follow_muted = true \
         WHERE follower = $1 AND following = (SELECT id FROM hive_accounts WHERE name = $2)";
    const SENTINEL_BOTH: &str = "UPDATE hive_follows SET follow_blacklists = true, follow_muted = true \
         WHERE follower = $1 AND following = (SELECT id FROM hive_accounts WHERE name = $2)";

    match scope {
        ResetScope::Blacklist => {
            ("UPDATE hive_follows SET blacklisted = false WHERE follower = $1", None)
        }
        ResetScope::FollowingList => {
            ("UPDATE hive_follows SET state = 0 WHERE follower = $1 AND state = 1", None)
        }
        ResetScope::MutedList => {
            ("UPDATE hive_follows SET state = 0 WHERE follower = $1 AND state = 2", None)
        }
        ResetScope::FollowBlacklist => (
            "UPDATE hive_follows SET follow_blacklists = false WHERE follower = $1",
            Some(SENTINEL_BLACKLISTS),
        ),
        ResetScope::FollowMutedList => (
            "UPDATE hive_follows SET follow_muted = false WHERE follower = $1",
            Some(SENTINEL_MUTED),
        ),
        ResetScope::AllLists => (
            "UPDATE hive_follows SET blacklisted = false, follow_blacklists = false, \
             follow_muted = false, state = 0 WHERE follower = $1",
            Some(SENTINEL_BOTH),
        ),
    }
}

/// Indexes follow operations into `hive_follows`.
pub struct FollowIndexer {
    db: Db,
    mode: ModeHandle,
    buffer: HashMap<(i32, i32), BufferedEdge>,
}

impl FollowIndexer {
    pub fn new(db: Db, mode: ModeHandle) -> Self {
        Self { db, mode, buffer: HashMap::new() }
    }

    /// Number of edges currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Process an incoming follow operation.
    ///
    /// Invalid payloads — wrong shape, unknown intent, impersonation,
    /// self-follow, or accounts that do not exist — are dropped
    /// silently.
    pub async fn follow_op(
        &mut self,
        acting_account: &str,
        body: &Value,
        at: NaiveDateTime,
        deltas: &mut DeltaAggregator,
    ) -> Result<()> {
        counter!("follow_ops_total").increment(1);

        let Some(op) = FollowOperation::validated(acting_account, body, at) else {
            counter!("follow_ops_dropped_total").increment(1);
            tracing::debug!("Dropping invalid follow payload from {}", acting_account);
            return Ok(());
        };

        let Some((follower_id, target_ids)) = self.resolve(&op).await? else {
            counter!("follow_ops_dropped_total").increment(1);
            tracing::debug!("Dropping follow from {} naming unknown accounts", op.follower);
            return Ok(());
        };

        if self.mode.is_initial_sync() {
            // multi-target payloads buffer one edge per target
            for following_id in target_ids {
                self.buffer_edge(follower_id, following_id, op.state, op.at);
            }
            return Ok(());
        }

        if let Some(scope) = op.state.reset_scope() {
            return self.apply_reset(follower_id, scope).await;
        }

        for following_id in target_ids {
            self.live_edge_write(follower_id, following_id, &op, deltas).await?;
        }
        Ok(())
    }

    /// Resolve the operation's account names to ids.
    ///
    /// Returns `None` if any named account does not exist.
    async fn resolve(&self, op: &FollowOperation) -> Result<Option<(i32, Vec<i32>)>> {
        let mut names: Vec<&str> = vec![op.follower.as_str()];
        names.extend(op.target.names().iter().map(String::as_str));

        let rows: Vec<(i32, String)> =
            sqlx::query_as("SELECT id, name FROM hive_accounts WHERE name = ANY($1)")
                .bind(&names)
                .fetch_all(self.db.pool())
                .await?;
        let by_name: HashMap<&str, i32> =
            rows.iter().map(|(id, name)| (name.as_str(), *id)).collect();

        let Some(&follower_id) = by_name.get(op.follower.as_str()) else {
            return Ok(None);
        };
        let mut target_ids = Vec::with_capacity(op.target.names().len());
        for name in op.target.names() {
            match by_name.get(name.as_str()) {
                Some(&id) => target_ids.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some((follower_id, target_ids)))
    }

    /// Buffer an edge during initial sync. A later operation for the
    /// same pair overwrites the buffered state but keeps the original
    /// timestamp (`created_at` is immutable after first insert).
    fn buffer_edge(&mut self, follower: i32, following: i32, state: FollowState, at: NaiveDateTime) {
        counter!("follow_ops_buffered_total").increment(1);
        self.buffer
            .entry((follower, following))
            .and_modify(|edge| edge.state = state)
            .or_insert(BufferedEdge { follower, following, state, at });
    }

    /// Live write of a single edge: read prior row, merge in memory,
    /// plain upsert, then record count deltas and the notification.
    ///
    /// The ingestion stream is single-writer per edge, which is what
    /// makes the read-merge-write safe without row locks.
    async fn live_edge_write(
        &self,
        follower: i32,
        following: i32,
        op: &FollowOperation,
        deltas: &mut DeltaAggregator,
    ) -> Result<()> {
        let prior: Option<(i16, bool, bool, bool)> = sqlx::query_as(
            "SELECT state, blacklisted, follow_blacklists, follow_muted \
             FROM hive_follows WHERE follower = $1 AND following = $2",
        )
        .bind(follower)
        .bind(following)
        .fetch_optional(self.db.pool())
        .await?;

        let old_state = prior.map(|(state, ..)| state);
        let merged = merge(
            prior.map(|(state, blacklisted, follow_blacklists, follow_muted)| {
                (state, EdgeFlags { blacklisted, follow_blacklists, follow_muted })
            }),
            op.state,
        );

        sqlx::query(
            "INSERT INTO hive_follows \
                 (follower, following, created_at, state, blacklisted, follow_blacklists, follow_muted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (follower, following) DO UPDATE SET \
                 state = EXCLUDED.state, \
                 blacklisted = EXCLUDED.blacklisted, \
                 follow_blacklists = EXCLUDED.follow_blacklists, \
                 follow_muted = EXCLUDED.follow_muted",
        )
        .bind(follower)
        .bind(following)
        .bind(op.at)
        .bind(merged.state)
        .bind(merged.flags.blacklisted)
        .bind(merged.flags.follow_blacklists)
        .bind(merged.flags.follow_muted)
        .execute(self.db.pool())
        .await?;

        let effects = edge_effects(old_state, op.state);
        if effects.follow_delta {
            deltas.apply(follower, CounterRole::Following, 1);
            deltas.apply(following, CounterRole::Followers, 1);
        }
        if effects.unfollow_delta {
            deltas.apply(follower, CounterRole::Following, -1);
            deltas.apply(following, CounterRole::Followers, -1);
        }
        if effects.notify {
            self.notify_follow(follower, following, op.at).await?;
        }
        Ok(())
    }

    /// Apply a reset operation (states 9–14) as one or two bulk
    /// updates scoped to the follower. The sentinel row for the
    /// reserved account must exist beforehand.
    async fn apply_reset(&self, follower: i32, scope: ResetScope) -> Result<()> {
        let (clear_sql, sentinel_sql) = reset_statements(scope);
        sqlx::query(clear_sql).bind(follower).execute(self.db.pool()).await?;
        if let Some(sentinel_sql) = sentinel_sql {
            sqlx::query(sentinel_sql)
                .bind(follower)
                .bind(NULL_ACCOUNT)
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    async fn notify_follow(&self, src: i32, dst: i32, at: NaiveDateTime) -> Result<()> {
        sqlx::query(
            "INSERT INTO hive_notifications (type_id, src_id, dst_id, created_at, score) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(NOTIFY_TYPE_FOLLOW)
        .bind(src)
        .bind(dst)
        .bind(at)
        .bind(DEFAULT_NOTIFY_SCORE)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Drain the buffered-edge map as batched multi-row upserts and
    /// flush pending follow-count deltas for both roles, all inside
    /// one transaction.
    ///
    /// Edges and deltas commit together: a failure anywhere rolls
    /// back the whole flush, so a replayed window re-applies every
    /// delta exactly once instead of double-counting the part that
    /// had already landed.
    ///
    /// Returns the number of accounts whose counters were updated;
    /// `0` with no database call when nothing is pending.
    pub async fn flush(&mut self, deltas: &mut DeltaAggregator) -> Result<usize> {
        let edges: Vec<BufferedEdge> = self.buffer.drain().map(|(_, edge)| edge).collect();
        let groups = deltas.take_grouped();
        if edges.is_empty() && groups.is_empty() {
            return Ok(0);
        }

        let mut tx = self.db.pool().begin().await?;
        for chunk in edges.chunks(FLUSH_BATCH_SIZE) {
            let mut query: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO hive_follows AS hf \
                 (follower, following, created_at, state, blacklisted, follow_blacklists, follow_muted) ",
            );
            query.push_values(chunk, |mut row, edge| {
                let code = edge.state.code();
                row.push_bind(edge.follower)
                    .push_bind(edge.following)
                    .push_bind(edge.at)
                    .push_bind(code)
                    .push_bind(code == 3)
                    .push_bind(code == 4)
                    .push_bind(code == 7);
            });
            query.push(FOLLOW_CONFLICT_CLAUSE);
            query.build().execute(&mut *tx).await?;
        }
        let updated = DeltaAggregator::execute_groups(&groups, &mut tx).await?;
        tx.commit().await?;

        counter!("follow_accounts_flushed_total").increment(updated as u64);
        tracing::info!(
            "[SYNC] flushed {} buffered edges and {} follow deltas",
            edges.len(),
            updated
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> NaiveDateTime {
        chrono::DateTime::from_timestamp(1_600_000_000, 0).unwrap().naive_utc()
    }

    fn indexer() -> FollowIndexer {
        // lazy pool: valid handle, no connection is ever made
        let db = Db::connect_lazy("postgres://localhost/hive_test", 2).unwrap();
        FollowIndexer::new(db, ModeHandle::new_initial())
    }

    // =========================================================================
    // Edge-effect decisions
    // =========================================================================

    #[test]
    fn test_new_follow_counts_and_notifies() {
        // no prior edge, blog → +1 both sides, notification
        let fx = edge_effects(None, FollowState::Blog);
        assert!(fx.follow_delta);
        assert!(!fx.unfollow_delta);
        assert!(fx.notify);
    }

    #[test]
    fn test_follow_to_ignore_decrements_only() {
        let fx = edge_effects(Some(1), FollowState::Ignore);
        assert!(!fx.follow_delta);
        assert!(fx.unfollow_delta);
        assert!(!fx.notify);
    }

    #[test]
    fn test_reaffirmed_follow_nets_to_zero() {
        let fx = edge_effects(Some(1), FollowState::Blog);
        assert!(fx.follow_delta);
        assert!(fx.unfollow_delta);
        assert!(!fx.notify);
    }

    #[test]
    fn test_existing_edge_follow_does_not_notify() {
        let fx = edge_effects(Some(0), FollowState::Blog);
        assert!(fx.follow_delta);
        assert!(!fx.unfollow_delta);
        assert!(!fx.notify);
    }

    #[test]
    fn test_non_follow_states_have_no_count_effect() {
        for state in [FollowState::Nothing, FollowState::Blacklist, FollowState::FollowMuted] {
            let fx = edge_effects(None, state);
            assert!(!fx.follow_delta);
            assert!(!fx.unfollow_delta);
            assert!(!fx.notify);
        }
    }

    // =========================================================================
    // Reset statement mapping
    // =========================================================================

    #[test]
    fn test_reset_all_lists_shape() {
        let (clear, sentinel) = reset_statements(ResetScope::AllLists);
        assert!(clear.contains("blacklisted = false"));
        assert!(clear.contains("follow_blacklists = false"));
        assert!(clear.contains("follow_muted = false"));
        assert!(clear.contains("state = 0"));
        let sentinel = sentinel.unwrap();
        assert!(sentinel.contains("follow_blacklists = true"));
        assert!(sentinel.contains("follow_muted = true"));
    }

    #[test]
    fn test_single_statement_resets_have_no_sentinel() {
        for scope in [ResetScope::Blacklist, ResetScope::FollowingList, ResetScope::MutedList] {
            assert!(reset_statements(scope).1.is_none());
        }
    }

    #[test]
    fn test_following_and_muted_resets_are_state_scoped() {
        let (clear, _) = reset_statements(ResetScope::FollowingList);
        assert!(clear.contains("state = 1"));
        let (clear, _) = reset_statements(ResetScope::MutedList);
        assert!(clear.contains("state = 2"));
    }

    #[test]
    fn test_followed_list_resets_mark_their_own_flag() {
        let (clear, sentinel) = reset_statements(ResetScope::FollowBlacklist);
        assert!(clear.contains("follow_blacklists = false"));
        assert!(sentinel.unwrap().contains("follow_blacklists = true"));

        let (clear, sentinel) = reset_statements(ResetScope::FollowMutedList);
        assert!(clear.contains("follow_muted = false"));
        assert!(sentinel.unwrap().contains("follow_muted = true"));
    }

    // =========================================================================
    // Buffered edges
    // =========================================================================

    #[tokio::test]
    async fn test_buffer_last_write_wins() {
        let mut indexer = indexer();
        indexer.buffer_edge(1, 2, FollowState::Blog, at());
        indexer.buffer_edge(1, 2, FollowState::Ignore, at());
        assert_eq!(indexer.buffered_len(), 1);
        let edge = &indexer.buffer[&(1, 2)];
        assert_eq!(edge.state, FollowState::Ignore);
    }

    #[tokio::test]
    async fn test_buffer_keeps_first_timestamp() {
        let mut indexer = indexer();
        let first = at();
        let later = first + chrono::Duration::seconds(60);
        indexer.buffer_edge(1, 2, FollowState::Blog, first);
        indexer.buffer_edge(1, 2, FollowState::Ignore, later);
        assert_eq!(indexer.buffer[&(1, 2)].at, first);
    }

    #[tokio::test]
    async fn test_buffer_is_keyed_per_pair() {
        let mut indexer = indexer();
        indexer.buffer_edge(1, 2, FollowState::Blog, at());
        indexer.buffer_edge(1, 3, FollowState::Blog, at());
        indexer.buffer_edge(2, 3, FollowState::Blog, at());
        assert_eq!(indexer.buffered_len(), 3);
    }

    // =========================================================================
    // Flush
    // =========================================================================

    #[tokio::test]
    async fn test_flush_with_nothing_pending_makes_no_db_call() {
        // lazy pool: even a BEGIN would fail, so Ok(0) proves the
        // short-circuit fired before any statement was issued
        let mut indexer = indexer();
        let mut deltas = DeltaAggregator::new();
        assert_eq!(indexer.flush(&mut deltas).await.unwrap(), 0);
    }

    // =========================================================================
    // Conflict clause
    // =========================================================================

    #[test]
    fn test_conflict_clause_matches_merge_policy() {
        // state 0 keeps the stored state rather than clobbering it
        assert!(FOLLOW_CONFLICT_CLAUSE.contains("WHEN 0 THEN hf.state"));
        // each flag is forced only by its own transitions
        assert!(FOLLOW_CONFLICT_CLAUSE.contains("WHEN 3 THEN TRUE WHEN 5 THEN FALSE ELSE hf.blacklisted"));
        assert!(FOLLOW_CONFLICT_CLAUSE.contains("WHEN 4 THEN TRUE WHEN 6 THEN FALSE ELSE hf.follow_blacklists"));
        assert!(FOLLOW_CONFLICT_CLAUSE.contains("WHEN 7 THEN TRUE WHEN 8 THEN FALSE ELSE hf.follow_muted"));
    }
}
