// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of candidate key nodes.
use serde::{Deserialize, Serialize};

/// Default number of local candidate parts kept for matching.
pub const DEFAULT_CANDIDATE_HISTORY_SIZE: usize = 256;

/// Default number of matching parts remembered per remote.
pub const DEFAULT_MATCH_HISTORY_SIZE: usize = 64;

/// Default number of matching rounds required before a key is generated.
pub const DEFAULT_MIN_MATCHING_PARTS: usize = 8;

/// Default minimum sum of entropy estimates (in bits) of the matching parts of a key.
pub const DEFAULT_MIN_MATCHING_ENTROPY: f32 = 64.0;

/// Default number of rounds after which a remote without enough matches is given up.
pub const DEFAULT_MAX_ROUNDS: usize = 32;

/// Default number of unmatched incoming candidate sets buffered for later rounds.
pub const DEFAULT_INCOMING_BUFFER_SIZE: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateKeyConfig {
    /// Number of local candidate parts kept in history, across all rounds.
    pub candidate_history_size: usize,

    /// Number of matching parts remembered for every remote.
    pub match_history_size: usize,

    /// Number of rounds with a matching part required before a key is generated.
    pub min_matching_parts: usize,

    /// Sum of entropy estimates in bits the matching parts need to reach before a key is
    /// generated.
    pub min_matching_entropy: f32,

    /// A remote which has not reached the quota after both sides ran this many rounds fails with
    /// [`NoMatch`](crate::CandidateKeyError::NoMatch).
    pub max_rounds: usize,

    /// Multicast our candidates for every round.
    ///
    /// Nodes which only listen need `send_matches` so the remote learns about matches.
    pub broadcast_candidates: bool,

    /// Report matching candidates back to their sender with a `MATCH` message.
    pub send_matches: bool,

    /// Number of unmatched incoming candidate sets kept for matching against later rounds.
    pub incoming_buffer_size: usize,
}

impl Default for CandidateKeyConfig {
    fn default() -> Self {
        Self {
            candidate_history_size: DEFAULT_CANDIDATE_HISTORY_SIZE,
            match_history_size: DEFAULT_MATCH_HISTORY_SIZE,
            min_matching_parts: DEFAULT_MIN_MATCHING_PARTS,
            min_matching_entropy: DEFAULT_MIN_MATCHING_ENTROPY,
            max_rounds: DEFAULT_MAX_ROUNDS,
            broadcast_candidates: true,
            send_matches: false,
            incoming_buffer_size: DEFAULT_INCOMING_BUFFER_SIZE,
        }
    }
}
