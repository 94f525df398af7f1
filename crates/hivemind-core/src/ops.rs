//! Operation payload parsing and structural validation.
//!
//! Upstream delivers decoded blockchain operations as `(account, JSON
//! body, timestamp)` triples. This module normalizes the dynamic JSON
//! into strongly typed operations exactly once, before any write-path
//! logic runs.
//!
//! Validation here is purely structural (shape, impersonation guard,
//! self-follow rules, intent vocabulary). Whether the named accounts
//! actually exist is checked later, at id-resolution time, because it
//! needs the store. A payload that fails validation normalizes to
//! `None` and is dropped silently — no row is written and no error is
//! surfaced upward.

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;

use crate::follow_state::FollowState;
use crate::Result;

/// The target side of a follow operation.
///
/// The wire format allows `following` to be either a single account
/// name or a list of names; this is the tagged form that the rest of
/// the system works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowTarget {
    Single(String),
    Multi(Vec<String>),
}

impl FollowTarget {
    /// All target account names, in payload order.
    pub fn names(&self) -> &[String] {
        match self {
            FollowTarget::Single(name) => std::slice::from_ref(name),
            FollowTarget::Multi(names) => names,
        }
    }
}

/// A validated, normalized follow operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowOperation {
    /// The acting account (verified equal to the payload's follower).
    pub follower: String,
    /// Target account(s), verified to exclude the follower.
    pub target: FollowTarget,
    /// Resolved state from the intent vocabulary.
    pub state: FollowState,
    /// Operation timestamp, becomes `created_at` on first insert.
    pub at: NaiveDateTime,
}

/// Raw shape of a follow payload, before validation.
#[derive(Debug, Deserialize)]
struct RawFollow {
    follower: String,
    following: Value,
    what: Vec<Value>,
}

impl FollowOperation {
    /// Validate and normalize a follow payload.
    ///
    /// Returns `None` (a silent drop) when:
    /// - the payload is missing fields or has the wrong shape
    /// - the first `what` entry is not a string or is an unknown intent
    /// - the payload's follower differs from the acting account
    /// - the target is the follower, or a target list contains it
    pub fn validated(acting_account: &str, body: &Value, at: NaiveDateTime) -> Option<Self> {
        let raw: RawFollow = serde_json::from_value(body.clone()).ok()?;

        // impersonation guard
        if raw.follower != acting_account {
            return None;
        }

        // the intent is the first entry of `what`; an empty list means ''
        let what = match raw.what.first() {
            None => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return None,
        };
        let state = FollowState::from_what(what)?;

        let target = match raw.following {
            Value::String(name) => {
                if name == raw.follower {
                    return None; // can't follow self
                }
                FollowTarget::Single(name)
            }
            Value::Array(entries) => {
                let names: Vec<String> = entries
                    .into_iter()
                    .map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect::<Option<_>>()?;
                if names.is_empty() || names.iter().any(|n| *n == raw.follower) {
                    return None;
                }
                FollowTarget::Multi(names)
            }
            _ => return None,
        };

        Some(FollowOperation { follower: raw.follower, target, state, at })
    }
}

/// A decoded vote operation, identified by natural keys.
///
/// Votes are written immediately in both sync modes; aggregate
/// vote-derived columns are restored by the finalization task graph.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VoteOperation {
    pub voter: String,
    pub author: String,
    pub permlink: String,
    pub weight: i64,
    pub rshares: i64,
    pub vote_percent: i32,
}

/// Envelope shape the upstream feed uses for vote operations.
#[derive(Debug, Deserialize)]
struct VoteEnvelope {
    value: VoteOperation,
}

impl VoteOperation {
    /// Parse a vote operation from its wire envelope.
    pub fn from_envelope(body: &Value) -> Result<Self> {
        let envelope: VoteEnvelope = serde_json::from_value(body.clone())?;
        Ok(envelope.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at() -> NaiveDateTime {
        chrono::DateTime::from_timestamp(1_600_000_000, 0).unwrap().naive_utc()
    }

    // =========================================================================
    // Follow payload validation
    // =========================================================================

    #[test]
    fn test_single_target_follow() {
        let body = json!({"follower": "alice", "following": "bob", "what": ["blog"]});
        let op = FollowOperation::validated("alice", &body, at()).unwrap();
        assert_eq!(op.follower, "alice");
        assert_eq!(op.target, FollowTarget::Single("bob".to_string()));
        assert_eq!(op.state, FollowState::Blog);
    }

    #[test]
    fn test_empty_what_means_state_zero() {
        let body = json!({"follower": "alice", "following": "bob", "what": []});
        let op = FollowOperation::validated("alice", &body, at()).unwrap();
        assert_eq!(op.state.code(), 0);
    }

    #[test]
    fn test_impersonation_is_dropped() {
        let body = json!({"follower": "alice", "following": "bob", "what": ["blog"]});
        assert!(FollowOperation::validated("mallory", &body, at()).is_none());
    }

    #[test]
    fn test_self_follow_is_dropped() {
        let body = json!({"follower": "alice", "following": "alice", "what": ["blog"]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    #[test]
    fn test_unknown_intent_is_dropped() {
        let body = json!({"follower": "alice", "following": "bob", "what": ["boost"]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    #[test]
    fn test_non_string_intent_is_dropped() {
        let body = json!({"follower": "alice", "following": "bob", "what": [7]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    #[test]
    fn test_missing_fields_are_dropped() {
        assert!(FollowOperation::validated("alice", &json!({}), at()).is_none());
        let body = json!({"follower": "alice", "what": ["blog"]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
        let body = json!({"follower": "alice", "following": "bob", "what": "blog"});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    #[test]
    fn test_multi_target_follow() {
        let body = json!({"follower": "alice", "following": ["bob", "carol"], "what": ["ignore"]});
        let op = FollowOperation::validated("alice", &body, at()).unwrap();
        assert_eq!(
            op.target,
            FollowTarget::Multi(vec!["bob".to_string(), "carol".to_string()])
        );
        assert_eq!(op.target.names().len(), 2);
    }

    #[test]
    fn test_multi_target_containing_follower_is_dropped() {
        let body = json!({"follower": "alice", "following": ["bob", "alice"], "what": ["blog"]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    #[test]
    fn test_empty_target_list_is_dropped() {
        let body = json!({"follower": "alice", "following": [], "what": ["blog"]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    #[test]
    fn test_non_string_target_entry_is_dropped() {
        let body = json!({"follower": "alice", "following": ["bob", 2], "what": ["blog"]});
        assert!(FollowOperation::validated("alice", &body, at()).is_none());
    }

    // =========================================================================
    // Vote payload parsing
    // =========================================================================

    #[test]
    fn test_vote_envelope() {
        let body = json!({
            "value": {
                "voter": "carol",
                "author": "alice",
                "permlink": "first-post",
                "weight": 10000,
                "rshares": 1234567,
                "vote_percent": 10000
            }
        });
        let vote = VoteOperation::from_envelope(&body).unwrap();
        assert_eq!(vote.voter, "carol");
        assert_eq!(vote.author, "alice");
        assert_eq!(vote.permlink, "first-post");
        assert_eq!(vote.weight, 10000);
        assert_eq!(vote.rshares, 1_234_567);
        assert_eq!(vote.vote_percent, 10000);
    }

    #[test]
    fn test_malformed_vote_is_an_error() {
        let body = json!({"value": {"voter": "carol"}});
        assert!(VoteOperation::from_envelope(&body).is_err());
    }
}
