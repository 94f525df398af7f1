//! Vote operation indexing.
//!
//! Votes are written immediately in both sync modes: the row is
//! resolved from natural keys `(author, permlink, voter)` at write
//! time and upserted on `(post_id, voter_id)`. A re-vote overwrites
//! weight/rshares/percent and bumps `num_changes`. Aggregate
//! vote-derived post columns are restored separately by the phase-0
//! finalization task, not here.

use chrono::NaiveDateTime;
use metrics::counter;
use serde_json::Value;

use hivemind_core::VoteOperation;

use crate::db::Db;
use crate::Result;

/// Natural-key resolving upsert. The joined `SELECT` yields no row
/// when the post or voter is unknown, which makes the insert a no-op.
const VOTE_UPSERT_SQL: &str = r#"
    INSERT INTO hive_votes
          (post_id, voter_id, author_id, permlink_id, weight, rshares, vote_percent, last_update)
    SELECT hp.id, ha_v.id, ha_a.id, hpd_p.id, $1, $2, $3, $4
    FROM hive_accounts ha_v,
         hive_posts hp
    INNER JOIN hive_accounts ha_a ON ha_a.id = hp.author_id
    INNER JOIN hive_permlink_data hpd_p ON hpd_p.id = hp.permlink_id
    WHERE ha_a.name = $5 AND hpd_p.permlink = $6 AND ha_v.name = $7
    ON CONFLICT (post_id, voter_id) DO UPDATE
        SET
            weight = EXCLUDED.weight,
            rshares = EXCLUDED.rshares,
            vote_percent = EXCLUDED.vote_percent,
            last_update = EXCLUDED.last_update,
            num_changes = hive_votes.num_changes + 1
"#;

/// Indexes vote operations into `hive_votes`.
pub struct VoteIndexer {
    db: Db,
}

impl VoteIndexer {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Process an incoming vote operation.
    pub async fn vote_op(&self, body: &Value, at: NaiveDateTime) -> Result<()> {
        let vote = VoteOperation::from_envelope(body)?;

        sqlx::query(VOTE_UPSERT_SQL)
            .bind(vote.weight)
            .bind(vote.rshares)
            .bind(vote.vote_percent)
            .bind(at)
            .bind(&vote.author)
            .bind(&vote.permlink)
            .bind(&vote.voter)
            .execute(self.db.pool())
            .await?;

        counter!("vote_ops_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keys_on_post_and_voter() {
        assert!(VOTE_UPSERT_SQL.contains("ON CONFLICT (post_id, voter_id)"));
    }

    #[test]
    fn test_revote_bumps_num_changes() {
        // first vote inserts the baseline row (num_changes defaults
        // to 0), a conflicting re-vote increments it
        assert!(VOTE_UPSERT_SQL.contains("num_changes = hive_votes.num_changes + 1"));
        assert!(VOTE_UPSERT_SQL.contains("weight = EXCLUDED.weight"));
        assert!(VOTE_UPSERT_SQL.contains("last_update = EXCLUDED.last_update"));
    }

    #[test]
    fn test_resolution_is_by_natural_keys() {
        for fragment in ["ha_a.name = $5", "hpd_p.permlink = $6", "ha_v.name = $7"] {
            assert!(VOTE_UPSERT_SQL.contains(fragment), "{}", fragment);
        }
    }
}
