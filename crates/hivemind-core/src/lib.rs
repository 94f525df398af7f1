//! Core types, operation normalization, and shared utilities for the
//! hivemind sync engine.
//!
//! This crate provides:
//! - Follow/vote operation payload parsing and structural validation
//! - The follow-edge conflict-merge policy as a pure function
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Everything in here is database-free: payloads are normalized into
//! strongly typed operations once, before any write-path logic runs.

mod error;
pub mod follow_state;
pub mod metrics;
pub mod ops;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Reserved sentinel account. Its follow rows carry aggregate
/// reset-list preference flags and must exist before reset operations
/// are processed.
pub const NULL_ACCOUNT: &str = "null";

/// Default notification score assigned to new-follow notifications.
pub const DEFAULT_NOTIFY_SCORE: i16 = 25;

pub use error::{Error, Result};
pub use follow_state::{merge, EdgeFlags, FollowState, MergedEdge, ResetScope};
pub use ops::{FollowOperation, FollowTarget, VoteOperation};
