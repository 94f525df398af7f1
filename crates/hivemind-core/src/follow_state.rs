//! Follow-edge state vocabulary and the conflict-merge policy.
//!
//! A follow edge `(follower, following)` stores a small-integer
//! `state` plus three derived booleans. Incoming operations carry a
//! textual intent (`"blog"`, `"ignore"`, `"reset_all_lists"`, …) that
//! maps onto a fixed vocabulary of 15 states. States 0–8 are edge
//! mutations resolved through [`merge`]; states 9–14 are reset
//! operations scoped to the follower as a whole.
//!
//! The merge policy is deliberately a pure function here rather than
//! SQL: the live write path reads the prior row, merges in memory and
//! performs a plain upsert, while the bulk flush path expresses the
//! same policy as an `ON CONFLICT` clause.

/// The fixed follow-intent vocabulary.
///
/// Discriminants are the stored `state` codes and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum FollowState {
    /// `''` — clears intent without overwriting a prior non-zero state.
    Nothing = 0,
    /// `blog` — a plain follow.
    Blog = 1,
    /// `ignore` — a mute.
    Ignore = 2,
    /// `blacklist` — add target to the follower's blacklist.
    Blacklist = 3,
    /// `follow_blacklist` — follow the target's blacklist.
    FollowBlacklist = 4,
    /// `unblacklist`.
    Unblacklist = 5,
    /// `unfollow_blacklist`.
    UnfollowBlacklist = 6,
    /// `follow_muted` — follow the target's mute list.
    FollowMuted = 7,
    /// `unfollow_muted`.
    UnfollowMuted = 8,
    /// `reset_blacklist`.
    ResetBlacklist = 9,
    /// `reset_following_list`.
    ResetFollowingList = 10,
    /// `reset_muted_list`.
    ResetMutedList = 11,
    /// `reset_follow_blacklist`.
    ResetFollowBlacklist = 12,
    /// `reset_follow_muted_list`.
    ResetFollowMutedList = 13,
    /// `reset_all_lists`.
    ResetAllLists = 14,
}

impl FollowState {
    /// Map a textual intent onto a state. Unknown intents yield `None`
    /// and the operation is dropped by the caller.
    pub fn from_what(what: &str) -> Option<Self> {
        use FollowState::*;
        Some(match what {
            "" => Nothing,
            "blog" => Blog,
            "ignore" => Ignore,
            "blacklist" => Blacklist,
            "follow_blacklist" => FollowBlacklist,
            "unblacklist" => Unblacklist,
            "unfollow_blacklist" => UnfollowBlacklist,
            "follow_muted" => FollowMuted,
            "unfollow_muted" => UnfollowMuted,
            "reset_blacklist" => ResetBlacklist,
            "reset_following_list" => ResetFollowingList,
            "reset_muted_list" => ResetMutedList,
            "reset_follow_blacklist" => ResetFollowBlacklist,
            "reset_follow_muted_list" => ResetFollowMutedList,
            "reset_all_lists" => ResetAllLists,
            _ => return None,
        })
    }

    /// The stored smallint code.
    pub fn code(self) -> i16 {
        self as i16
    }

    /// States 9–14 are follower-scoped reset operations rather than
    /// single-edge mutations.
    pub fn is_reset(self) -> bool {
        self.code() > 8
    }

    /// The reset scope for states 9–14, `None` for edge states 0–8.
    pub fn reset_scope(self) -> Option<ResetScope> {
        use FollowState::*;
        Some(match self {
            ResetBlacklist => ResetScope::Blacklist,
            ResetFollowingList => ResetScope::FollowingList,
            ResetMutedList => ResetScope::MutedList,
            ResetFollowBlacklist => ResetScope::FollowBlacklist,
            ResetFollowMutedList => ResetScope::FollowMutedList,
            ResetAllLists => ResetScope::AllLists,
            _ => return None,
        })
    }
}

/// What a reset operation (states 9–14) clears for the follower.
///
/// Scopes that clear a followed-list preference also set the
/// corresponding flag on the follower's edge to the reserved `"null"`
/// account, which acts as an aggregate preference marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Clear `blacklisted` on every edge of the follower.
    Blacklist,
    /// Zero the state of every `state = 1` (follow) edge.
    FollowingList,
    /// Zero the state of every `state = 2` (mute) edge.
    MutedList,
    /// Clear `follow_blacklists` everywhere, then mark the sentinel.
    FollowBlacklist,
    /// Clear `follow_muted` everywhere, then mark the sentinel.
    FollowMutedList,
    /// Clear all flags and states, then mark the sentinel for both
    /// followed-list preferences.
    AllLists,
}

/// The three derived booleans stored on a follow edge.
///
/// Each is a pure function of the state *transition*, not of history:
/// a given new state either forces a flag true, forces it false, or
/// leaves the stored value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeFlags {
    pub blacklisted: bool,
    pub follow_blacklists: bool,
    pub follow_muted: bool,
}

/// The resolved row an upsert should write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedEdge {
    pub state: i16,
    pub flags: EdgeFlags,
}

/// Resolve the row to store for an edge mutation (states 0–8).
///
/// `prior` is the currently stored `(state, flags)` pair, if the edge
/// exists. The policy:
///
/// - a new state of `0` never overwrites an existing non-zero state
/// - `blacklisted` is forced true on 3, false on 5, else kept
/// - `follow_blacklists` is forced true on 4, false on 6, else kept
/// - `follow_muted` is forced true on 7, false on 8, else kept
///
/// For a fresh edge the kept value is `false`.
pub fn merge(prior: Option<(i16, EdgeFlags)>, new: FollowState) -> MergedEdge {
    debug_assert!(!new.is_reset(), "reset states do not merge into a single edge");
    let (old_state, old_flags) = prior.unwrap_or((0, EdgeFlags::default()));
    let code = new.code();

    let state = if code == 0 { old_state } else { code };
    let flags = EdgeFlags {
        blacklisted: match code {
            3 => true,
            5 => false,
            _ => old_flags.blacklisted,
        },
        follow_blacklists: match code {
            4 => true,
            6 => false,
            _ => old_flags.follow_blacklists,
        },
        follow_muted: match code {
            7 => true,
            8 => false,
            _ => old_flags.follow_muted,
        },
    };
    MergedEdge { state, flags }
}
