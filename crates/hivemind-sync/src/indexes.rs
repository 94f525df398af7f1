//! Secondary-index and foreign-key lifecycle.
//!
//! Massive sync windows trade index maintenance and referential
//! integrity for bulk-load throughput: the disableable indexes and
//! all foreign keys are dropped before the window and rebuilt at
//! finalization. This module owns the catalogue of what can be
//! dropped and the idempotent reconcile loop that drops/creates
//! against the live schema.
//!
//! Existence checks always go to `pg_class`; the catalog is the
//! source of truth and is never cached across calls.

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::counter;

use crate::db::Db;
use crate::{Error, Result};

/// A named secondary index bound to exactly one table.
#[derive(Debug)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub create: &'static str,
}

/// A named foreign-key constraint.
#[derive(Debug)]
pub struct FkDef {
    pub name: &'static str,
    pub table: &'static str,
    pub definition: &'static str,
}

macro_rules! index {
    ($name:literal, $table:literal, $columns:literal) => {
        IndexDef {
            name: $name,
            table: $table,
            create: concat!("CREATE INDEX ", $name, " ON ", $table, " ", $columns),
        }
    };
}

/// Every index that may be dropped for a massive sync window.
///
/// Indexes not listed here (primary keys, unique constraints backing
/// natural keys) are load-bearing for the write path and always stay.
pub const DISABLEABLE_INDEXES: &[IndexDef] = &[
    index!("hive_blocks_created_at_idx", "hive_blocks", "(created_at)"),
    index!("hive_feed_cache_block_num_idx", "hive_feed_cache", "(block_num)"),
    index!("hive_feed_cache_created_at_idx", "hive_feed_cache", "(created_at)"),
    index!("hive_feed_cache_post_id_idx", "hive_feed_cache", "(post_id)"),
    index!("hive_follows_ix5a", "hive_follows", "(following, state, created_at, follower)"),
    index!("hive_follows_ix5b", "hive_follows", "(follower, state, created_at, following)"),
    index!("hive_follows_block_num_idx", "hive_follows", "(block_num)"),
    index!("hive_follows_created_at_idx", "hive_follows", "(created_at)"),
    index!("hive_posts_parent_id_id_idx", "hive_posts", "(parent_id, id)"),
    index!("hive_posts_depth_idx", "hive_posts", "(depth)"),
    index!("hive_posts_root_id_id_idx", "hive_posts", "(root_id, id)"),
    index!("hive_posts_community_id_id_idx", "hive_posts", "(community_id, id)"),
    index!("hive_posts_payout_at_idx", "hive_posts", "(payout_at)"),
    index!("hive_posts_payout_idx", "hive_posts", "(payout)"),
    index!("hive_posts_promoted_id_idx", "hive_posts", "(promoted, id)"),
    index!("hive_posts_sc_trend_id_idx", "hive_posts", "(sc_trend, id)"),
    index!("hive_posts_sc_hot_id_idx", "hive_posts", "(sc_hot, id)"),
    index!("hive_posts_block_num_idx", "hive_posts", "(block_num)"),
    index!("hive_posts_block_num_created_idx", "hive_posts", "(block_num_created)"),
    index!("hive_posts_cashout_time_id_idx", "hive_posts", "(cashout_time, id)"),
    index!("hive_posts_updated_at_idx", "hive_posts", "(updated_at)"),
    index!(
        "hive_posts_payout_plus_pending_payout_id_idx",
        "hive_posts",
        "((payout + pending_payout), id)"
    ),
    index!(
        "hive_posts_category_id_payout_plus_pending_payout_depth_idx",
        "hive_posts",
        "(category_id, (payout + pending_payout), depth)"
    ),
    index!("hive_posts_tags_ids_idx", "hive_posts", "USING gin (tags_ids)"),
    index!("hive_posts_author_id_created_at_id_idx", "hive_posts", "(author_id, created_at, id)"),
    index!("hive_posts_author_id_id_idx", "hive_posts", "(author_id, id)"),
    index!(
        "hive_posts_api_helper_author_s_permlink_idx",
        "hive_posts_api_helper",
        "(author_s_permlink)"
    ),
    index!("hive_votes_voter_id_last_update_idx", "hive_votes", "(voter_id, last_update)"),
    index!("hive_votes_block_num_idx", "hive_votes", "(block_num)"),
    index!("hive_votes_voter_id_post_id_idx", "hive_votes", "(voter_id, post_id)"),
    index!("hive_votes_post_id_voter_id_idx", "hive_votes", "(post_id, voter_id)"),
    index!("hive_subscriptions_block_num_idx", "hive_subscriptions", "(block_num)"),
    index!("hive_subscriptions_community_idx", "hive_subscriptions", "(community_id)"),
    index!("hive_communities_block_num_idx", "hive_communities", "(block_num)"),
    index!("hive_reblogs_created_at_idx", "hive_reblogs", "(created_at)"),
    index!("hive_reputation_data_block_num_idx", "hive_reputation_data", "(block_num)"),
    index!("hive_notification_cache_block_num_idx", "hive_notification_cache", "(block_num)"),
    index!("hive_notification_cache_dst_score_idx", "hive_notification_cache", "(dst, score)"),
];

/// Tables the index and FK catalogues may target. The index catalogue
/// must resolve entirely against this set at startup.
pub const KNOWN_TABLES: &[&str] = &[
    "hive_state",
    "hive_blocks",
    "hive_accounts",
    "hive_permlink_data",
    "hive_posts",
    "hive_posts_api_helper",
    "hive_follows",
    "hive_votes",
    "hive_feed_cache",
    "hive_reblogs",
    "hive_subscriptions",
    "hive_communities",
    "hive_reputation_data",
    "hive_notification_cache",
    "hive_notifications",
];

/// Foreign keys dropped for massive windows and recreated afterwards.
pub const FOREIGN_KEYS: &[FkDef] = &[
    FkDef {
        name: "hive_follows_fk1",
        table: "hive_follows",
        definition: "FOREIGN KEY (follower) REFERENCES hive_accounts (id)",
    },
    FkDef {
        name: "hive_follows_fk2",
        table: "hive_follows",
        definition: "FOREIGN KEY (following) REFERENCES hive_accounts (id)",
    },
    FkDef {
        name: "hive_posts_fk1",
        table: "hive_posts",
        definition: "FOREIGN KEY (author_id) REFERENCES hive_accounts (id)",
    },
    FkDef {
        name: "hive_votes_fk1",
        table: "hive_votes",
        definition: "FOREIGN KEY (post_id) REFERENCES hive_posts (id)",
    },
    FkDef {
        name: "hive_votes_fk2",
        table: "hive_votes",
        definition: "FOREIGN KEY (voter_id) REFERENCES hive_accounts (id)",
    },
    FkDef {
        name: "hive_feed_cache_fk1",
        table: "hive_feed_cache",
        definition: "FOREIGN KEY (account_id) REFERENCES hive_accounts (id)",
    },
    FkDef {
        name: "hive_reblogs_fk1",
        table: "hive_reblogs",
        definition: "FOREIGN KEY (blogger_id) REFERENCES hive_accounts (id)",
    },
];

/// Group a catalogue by table, verifying every entry resolves to a
/// known table.
///
/// A catalogue entry naming an unknown table means the schema and the
/// index inventory have drifted apart; proceeding would leave bulk
/// sync unable to restore index health, so this is fatal.
pub fn group_by_table(
    defs: &'static [IndexDef],
    known_tables: &[&str],
) -> Result<BTreeMap<&'static str, Vec<&'static IndexDef>>> {
    let mut grouped: BTreeMap<&'static str, Vec<&'static IndexDef>> = BTreeMap::new();
    let mut unresolved = Vec::new();
    for def in defs {
        if known_tables.contains(&def.table) {
            grouped.entry(def.table).or_default().push(def);
        } else {
            unresolved.push(def.name);
        }
    }
    if !unresolved.is_empty() {
        return Err(Error::StartupInvariant(format!(
            "indexes not located: {:?}",
            unresolved
        )));
    }
    Ok(grouped)
}

/// The disableable-index catalogue, grouped by table.
pub fn disableable_indexes() -> Result<BTreeMap<&'static str, Vec<&'static IndexDef>>> {
    group_by_table(DISABLEABLE_INDEXES, KNOWN_TABLES)
}

/// Drops and recreates catalogued indexes against the live schema.
#[derive(Clone)]
pub struct IndexLifecycle {
    db: Db,
    work_mem: String,
}

impl IndexLifecycle {
    pub fn new(db: Db, work_mem: String) -> Self {
        Self { db, work_mem }
    }

    /// Single boolean existence probe against the catalog.
    pub async fn has_index(&self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_class WHERE relname = $1")
            .bind(name)
            .fetch_one(self.db.pool())
            .await?;
        Ok(count == 1)
    }

    /// Reconcile one table's indexes.
    ///
    /// For each index: if `drop` is requested and the index exists it
    /// is dropped (a drop racing an already-altered schema is logged
    /// as a warning and skipped); if `create` is requested and the
    /// index is missing it is created, otherwise creation is skipped
    /// with a log line. If anything was created the table's
    /// statistics are refreshed.
    pub async fn reconcile_table(
        &self,
        table: &str,
        indexes: &[&IndexDef],
        is_pre_process: bool,
        drop: bool,
        create: bool,
    ) -> Result<()> {
        let phase = if is_pre_process { "pre" } else { "post" };
        tracing::info!("[INIT] Begin {}-sync index hooks for table {}", phase, table);

        let mut any_index_created = false;
        for index in indexes {
            tracing::info!(
                "{} index {}.{}",
                if is_pre_process { "Drop" } else { "Recreate" },
                index.table,
                index.name
            );

            if drop && self.has_index(index.name).await? {
                let start = Instant::now();
                let sql = format!("DROP INDEX {}", index.name);
                match self.db.execute_heavy(&sql, &self.work_mem).await {
                    Ok(()) => {
                        counter!("index_dropped_total").increment(1);
                        tracing::info!(
                            "Index {} dropped in time {:.4} s",
                            index.name,
                            start.elapsed().as_secs_f64()
                        );
                    }
                    // schema drifted under us; dropping an absent index is harmless
                    Err(e) => tracing::warn!("Ignoring drop of {}: {}", index.name, e),
                }
            }

            if create {
                if self.has_index(index.name).await? {
                    tracing::info!("Index {} already exists... Creation skipped.", index.name);
                } else {
                    let start = Instant::now();
                    self.db.execute_heavy(index.create, &self.work_mem).await?;
                    counter!("index_created_total").increment(1);
                    tracing::info!(
                        "Index {} created in time {:.4} s",
                        index.name,
                        start.elapsed().as_secs_f64()
                    );
                    any_index_created = true;
                }
            }
        }

        if any_index_created {
            let sql = format!("ANALYZE {}", table);
            self.db.execute_heavy(&sql, &self.work_mem).await?;
        }
        tracing::info!("[INIT] End {}-sync index hooks for table {}", phase, table);
        Ok(())
    }

    /// Drop every catalogued foreign key. Absent constraints are
    /// tolerated (`DROP CONSTRAINT IF EXISTS`).
    pub async fn drop_foreign_keys(&self) -> Result<()> {
        for fk in FOREIGN_KEYS {
            let sql = format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", fk.table, fk.name);
            sqlx::query(&sql).execute(self.db.pool()).await?;
            tracing::info!("Dropped FK {} on {}", fk.name, fk.table);
        }
        Ok(())
    }

    /// Recreate every catalogued foreign key that is missing.
    pub async fn create_foreign_keys(&self) -> Result<()> {
        for fk in FOREIGN_KEYS {
            let exists: i64 =
                sqlx::query_scalar("SELECT count(*) FROM pg_constraint WHERE conname = $1")
                    .bind(fk.name)
                    .fetch_one(self.db.pool())
                    .await?;
            if exists == 1 {
                tracing::info!("FK {} already exists... Creation skipped.", fk.name);
                continue;
            }
            let sql = format!("ALTER TABLE {} ADD CONSTRAINT {} {}", fk.table, fk.name, fk.definition);
            self.db.execute_heavy(&sql, &self.work_mem).await?;
            tracing::info!("Recreated FK {} on {}", fk.name, fk.table);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_resolves_against_known_tables() {
        let grouped = disableable_indexes().unwrap();
        let total: usize = grouped.values().map(|v| v.len()).sum();
        assert_eq!(total, DISABLEABLE_INDEXES.len());
        // spot checks
        assert!(grouped.contains_key("hive_follows"));
        assert_eq!(grouped["hive_follows"].len(), 4);
        assert!(grouped["hive_posts"].len() >= 15);
    }

    #[test]
    fn test_unresolved_index_is_fatal() {
        static BOGUS: &[IndexDef] = &[IndexDef {
            name: "hive_ghosts_idx",
            table: "hive_ghosts",
            create: "CREATE INDEX hive_ghosts_idx ON hive_ghosts (id)",
        }];
        let err = group_by_table(BOGUS, KNOWN_TABLES).unwrap_err();
        assert!(matches!(err, Error::StartupInvariant(_)));
        assert!(err.to_string().contains("hive_ghosts_idx"));
    }

    #[test]
    fn test_index_names_are_unique() {
        let mut names: Vec<_> = DISABLEABLE_INDEXES.iter().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DISABLEABLE_INDEXES.len());
    }

    #[test]
    fn test_create_statements_name_their_index_and_table() {
        for def in DISABLEABLE_INDEXES {
            assert!(def.create.contains(def.name), "{}", def.name);
            assert!(def.create.contains(def.table), "{}", def.name);
        }
    }

    #[test]
    fn test_foreign_keys_target_known_tables() {
        for fk in FOREIGN_KEYS {
            assert!(KNOWN_TABLES.contains(&fk.table), "{}", fk.name);
        }
    }
}
