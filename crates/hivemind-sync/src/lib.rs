//! Sync-state orchestration and incremental indexing for the
//! hivemind store.
//!
//! The engine ingests decoded blockchain operations and maintains a
//! denormalized Postgres store for social-graph and content queries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Operation feed  │  (decoded follow/vote payloads, external)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐     buffered edges + count deltas (bulk sync)
//! │ Follow/Vote      │ ──► or immediate conflict-merging upserts
//! │ indexers         │     (live sync)
//! └────────┬─────────┘
//!          │  sync-window boundary
//!          ▼
//! ┌──────────────────┐
//! │   SyncEngine     │  index/FK reconcile → phased task graph →
//! └──────────────────┘  watermark persist (+ vacuum when massive)
//! ```
//!
//! The mode decision — buffer or write through — is made in exactly
//! one place, the engine's [`state::ModeHandle`].

pub mod db;
pub mod deltas;
pub mod error;
pub mod follow;
pub mod indexes;
pub mod scheduler;
pub mod stats;
pub mod state;
pub mod votes;

pub use error::{Error, Result};

// Re-export the commonly used types at crate root
pub use db::Db;
pub use deltas::{CounterRole, DeltaAggregator};
pub use follow::FollowIndexer;
pub use scheduler::{MaintenanceTask, TaskScheduler};
pub use stats::StatsCollector;
pub use state::{ModeHandle, SyncConfig, SyncEngine, SyncStatus, SyncWindow, SYNCED_BLOCK_LIMIT};
pub use votes::VoteIndexer;
