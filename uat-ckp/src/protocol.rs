// SPDX-License-Identifier: MIT OR Apache-2.0

//! Matching table of the candidate key protocol.
//!
//! Every round a node derives a set of candidate key parts from its local view of a shared
//! physical phenomenon, for example quantized accelerometer readings. Only the double hashes of
//! these parts are published. Whenever the hash of a remote candidate equals the hash of a local
//! one, the local part is advanced into the match list of that remote. Once enough rounds matched,
//! the parts are concatenated in round order into a candidate key.
//!
//! Parts never leave the node, a remote can only learn that it holds the same part.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use tracing::{debug, trace, warn};
use uat_crypto::Secret;
use uat_crypto::sha2::{SHA256_DIGEST_SIZE, double_sha2_256};
use zeroize::Zeroizing;

use crate::error::CandidateKeyError;

/// Maximum number of candidate parts in a single round.
pub const MAX_PARTS_PER_ROUND: usize = 127;

pub const KEY_SIZE: usize = SHA256_DIGEST_SIZE;

/// Appended to the concatenated parts before deriving the key, so that the published key hash
/// and the key itself never coincide.
const KEY_LABEL: &[u8] = b"uat-candidate-key";

/// Upper bound of part combinations tried when searching for a remote key.
const MAX_SEARCH_COMBINATIONS: usize = 4096;

pub type CandidateHash = [u8; SHA256_DIGEST_SIZE];

/// Public identifier of a candidate part, safe to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateIdentifier {
    /// Round of the node which generated the part.
    pub round: u64,

    /// Position of the part within its round.
    pub number: u8,

    /// `SHA256(SHA256(part))`.
    pub hash: CandidateHash,
}

/// Key assembled from matching parts.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateKey {
    pub num_parts: usize,

    /// Published to the remote so it can search for the same combination of parts.
    pub hash: CandidateHash,

    pub key: Secret<KEY_SIZE>,
}

#[derive(Clone)]
struct CandidatePart {
    round: u64,
    number: u8,
    part: Zeroizing<Vec<u8>>,
    hash: CandidateHash,
    entropy: f32,
}

impl CandidatePart {
    fn identifier(&self) -> CandidateIdentifier {
        CandidateIdentifier {
            round: self.round,
            number: self.number,
            hash: self.hash,
        }
    }
}

impl fmt::Debug for CandidatePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidatePart")
            .field("round", &self.round)
            .field("number", &self.number)
            .field("hash", &hex::encode(self.hash))
            .field("entropy", &self.entropy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RemoteState {
    /// Oldest local round which was still in history when we first heard of the remote.
    first_round: u64,
    matches: VecDeque<CandidatePart>,
}

/// Candidate history and per-remote match lists.
#[derive(Debug)]
pub struct CandidateKeyProtocol {
    history: VecDeque<CandidatePart>,
    candidate_history_size: usize,
    match_history_size: usize,
    round: u64,
    remotes: HashMap<String, RemoteState>,
}

impl CandidateKeyProtocol {
    pub fn new(candidate_history_size: usize, match_history_size: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(candidate_history_size),
            candidate_history_size,
            match_history_size,
            round: 0,
            remotes: HashMap::new(),
        }
    }

    /// Last round assigned to local candidates, 0 before the first round.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Adds the parts of a new local round to the history and returns their public identifiers.
    ///
    /// Duplicate parts within the round are dropped, the remaining parts are numbered in the order
    /// they were given. `entropy` is the caller's estimate in bits for each of the parts.
    pub fn generate_candidates<P: AsRef<[u8]>>(
        &mut self,
        parts: &[P],
        entropy: f32,
    ) -> Result<Vec<CandidateIdentifier>, CandidateKeyError> {
        if !entropy.is_finite() || entropy < 0.0 {
            return Err(CandidateKeyError::InvalidArgument(format!(
                "entropy estimate {entropy} is not a non-negative number"
            )));
        }

        let mut unique: Vec<&[u8]> = Vec::with_capacity(parts.len());
        for part in parts {
            let part = part.as_ref();
            if unique.contains(&part) {
                debug!("dropping duplicate candidate part");
                continue;
            }
            unique.push(part);
        }

        if unique.is_empty() {
            return Err(CandidateKeyError::InvalidArgument(
                "no candidate parts given".into(),
            ));
        }
        if unique.len() > MAX_PARTS_PER_ROUND {
            return Err(CandidateKeyError::InvalidArgument(format!(
                "at most {MAX_PARTS_PER_ROUND} parts per round are supported"
            )));
        }
        if unique.len() > self.candidate_history_size {
            return Err(CandidateKeyError::InvalidArgument(format!(
                "{} parts do not fit into a history of {}",
                unique.len(),
                self.candidate_history_size
            )));
        }

        self.round += 1;
        debug!(round = self.round, parts = unique.len(), "adding local candidates");

        let mut identifiers = Vec::with_capacity(unique.len());
        for (number, part) in unique.into_iter().enumerate() {
            let candidate = CandidatePart {
                round: self.round,
                number: number as u8,
                part: Zeroizing::new(part.to_vec()),
                hash: double_sha2_256(&[part]),
                entropy,
            };
            identifiers.push(candidate.identifier());

            self.history.push_back(candidate);
            if self.history.len() > self.candidate_history_size {
                self.history.pop_front();
            }
        }

        Ok(identifiers)
    }

    /// Matches remote identifiers against the whole local history.
    ///
    /// Every local part with a matching hash is advanced into the match list of the remote.
    /// Returns the index of the first identifier which matched.
    pub fn match_candidates(
        &mut self,
        remote: &str,
        identifiers: &[CandidateIdentifier],
    ) -> Result<Option<usize>, CandidateKeyError> {
        if identifiers.len() > MAX_PARTS_PER_ROUND {
            return Err(CandidateKeyError::InvalidArgument(format!(
                "at most {MAX_PARTS_PER_ROUND} parts per round are supported"
            )));
        }

        let match_history_size = self.match_history_size;
        let mut first_match = None;
        for (index, identifier) in identifiers.iter().enumerate() {
            let parts: Vec<CandidatePart> = self
                .history
                .iter()
                .filter(|part| part.hash == identifier.hash)
                .cloned()
                .collect();

            let state = self.remote_mut(remote);
            for part in parts {
                trace!(
                    remote_round = identifier.round,
                    local_round = part.round,
                    number = part.number,
                    "remote candidate matches"
                );
                advance(state, part, match_history_size);
                first_match.get_or_insert(index);
            }
        }

        if first_match.is_none() {
            // Remember the remote to count its rounds
            self.remote_mut(remote);
            trace!("no match found in {} identifiers", identifiers.len());
        }

        Ok(first_match)
    }

    /// Advances the local part the remote reported as matching.
    ///
    /// Returns false when the part is unknown, probably because it already left the history, or
    /// when it was already matched.
    pub fn acknowledge_match(&mut self, remote: &str, round: u64, number: u8) -> bool {
        let Some(part) = self
            .history
            .iter()
            .find(|part| part.round == round && part.number == number)
            .cloned()
        else {
            warn!(round, number, "acknowledged candidate is not in history anymore");
            self.remote_mut(remote);
            return false;
        };

        let match_history_size = self.match_history_size;
        advance(self.remote_mut(remote), part, match_history_size)
    }

    /// Number of distinct local rounds with a matching part.
    pub fn num_matches(&self, remote: &str) -> usize {
        self.matched_rounds(remote).len()
    }

    /// Sum of entropy estimates of the parts a key would be assembled from.
    pub fn sum_match_entropy(&self, remote: &str) -> f32 {
        self.matched_rounds(remote)
            .iter()
            .map(|parts| parts[0].entropy)
            .sum()
    }

    /// Starts counting local rounds for the remote, if it is not known yet.
    pub fn add_remote(&mut self, remote: &str) {
        self.remote_mut(remote);
    }

    /// Number of local rounds since the remote became known.
    pub fn num_local_rounds(&self, remote: &str) -> u64 {
        match self.remotes.get(remote) {
            Some(state) if self.round >= state.first_round => self.round - state.first_round + 1,
            _ => 0,
        }
    }

    /// Fraction of local rounds with a matching part.
    pub fn matching_rounds_fraction(&self, remote: &str) -> f32 {
        let rounds = self.num_local_rounds(remote);
        if rounds == 0 {
            return 0.0;
        }
        (self.num_matches(remote) as f32 / rounds as f32).min(1.0)
    }

    /// Assembles a key from one matching part per round, ordered by local round.
    ///
    /// When several parts of a round matched, the one with the smallest hash is taken, so both
    /// sides pick the same part from the same set of matches.
    pub fn generate_key(&self, remote: &str) -> Result<CandidateKey, CandidateKeyError> {
        let rounds = self.matched_rounds(remote);
        if rounds.is_empty() {
            return Err(CandidateKeyError::NoMatch(format!(
                "no matching candidates for {remote}"
            )));
        }

        let parts: Vec<&[u8]> = rounds.iter().map(|parts| parts[0].part.as_slice()).collect();
        debug!(parts = parts.len(), "generating candidate key");
        Ok(derive_key(&parts))
    }

    /// Searches the matches for a combination of `num_parts` consecutive rounds producing the key
    /// hash a remote published.
    ///
    /// All matching parts of a round are tried, the number of combinations is bounded.
    pub fn search_key(
        &self,
        remote: &str,
        hash: &CandidateHash,
        num_parts: usize,
    ) -> Option<CandidateKey> {
        let rounds = self.matched_rounds(remote);
        if num_parts == 0 || num_parts > rounds.len() {
            debug!(
                num_parts,
                matches = rounds.len(),
                "not enough matches to search for remote key"
            );
            return None;
        }

        let mut tried = 0;
        for window in rounds.windows(num_parts) {
            let mut choice = vec![0; num_parts];
            loop {
                if tried == MAX_SEARCH_COMBINATIONS {
                    warn!("giving up search for remote key after {tried} combinations");
                    return None;
                }
                tried += 1;

                let parts: Vec<&[u8]> = window
                    .iter()
                    .zip(&choice)
                    .map(|(parts, &index)| parts[index].part.as_slice())
                    .collect();
                if double_sha2_256(&parts) == *hash {
                    debug!(tried, "found remote key");
                    return Some(derive_key(&parts));
                }

                if !next_combination(&mut choice, window) {
                    break;
                }
            }
        }

        None
    }

    /// Forgets all matches of the remote.
    ///
    /// Returns false when the remote was unknown.
    pub fn wipe(&mut self, remote: &str) -> bool {
        self.remotes.remove(remote).is_some()
    }

    /// Forgets all matches and the local history.
    pub fn wipe_all(&mut self) {
        self.remotes.clear();
        self.history.clear();
    }

    fn remote_mut(&mut self, remote: &str) -> &mut RemoteState {
        let first_round = self
            .history
            .front()
            .map_or(self.round + 1, |part| part.round);
        self.remotes
            .entry(remote.to_string())
            .or_insert_with(|| RemoteState {
                first_round,
                matches: VecDeque::new(),
            })
    }

    /// Matching parts grouped by local round, each group sorted by hash.
    fn matched_rounds(&self, remote: &str) -> Vec<Vec<&CandidatePart>> {
        let Some(state) = self.remotes.get(remote) else {
            return Vec::new();
        };

        let mut rounds: BTreeMap<u64, Vec<&CandidatePart>> = BTreeMap::new();
        for part in &state.matches {
            rounds.entry(part.round).or_default().push(part);
        }
        rounds
            .into_values()
            .map(|mut parts| {
                parts.sort_by(|a, b| a.hash.cmp(&b.hash));
                parts
            })
            .collect()
    }
}

/// Adds the part to the match list unless it is already there.
fn advance(state: &mut RemoteState, part: CandidatePart, limit: usize) -> bool {
    if state
        .matches
        .iter()
        .any(|matched| matched.round == part.round && matched.number == part.number)
    {
        trace!(round = part.round, number = part.number, "already matched");
        return false;
    }

    debug!(round = part.round, number = part.number, "advancing candidate to match");
    state.matches.push_back(part);
    if state.matches.len() > limit {
        state.matches.pop_front();
    }
    true
}

fn derive_key(parts: &[&[u8]]) -> CandidateKey {
    let hash = double_sha2_256(parts);

    let mut labelled = parts.to_vec();
    labelled.push(KEY_LABEL);
    let key = Secret::from_bytes(double_sha2_256(&labelled));

    CandidateKey {
        num_parts: parts.len(),
        hash,
        key,
    }
}

/// Moves to the next choice of one part per round, returns false after the last one.
fn next_combination(choice: &mut [usize], rounds: &[Vec<&CandidatePart>]) -> bool {
    for (index, parts) in choice.iter_mut().zip(rounds).rev() {
        *index += 1;
        if *index < parts.len() {
            return true;
        }
        *index = 0;
    }
    false
}
