// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII datagrams exchanged by candidate key nodes.
//!
//! ```text
//! CAND <round> <hash> <hash> ...   candidate identifiers of one round, numbered by position
//! MATCH <round> <number>           the receiver's candidate matched
//! KEY <parts> <hash>               hash of a key assembled from the given number of parts
//! ACK <hash>                       the key with this hash was found and accepted
//! NACK                             the sender gave up on the receiver
//! ```
use std::fmt;
use std::str::FromStr;

use crate::error::CandidateKeyError;
use crate::protocol::{CandidateHash, CandidateIdentifier, MAX_PARTS_PER_ROUND};

pub const CANDIDATES: &str = "CAND";

pub const MATCH: &str = "MATCH";

pub const KEY: &str = "KEY";

pub const ACK: &str = "ACK";

pub const NACK: &str = "NACK";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Candidates {
        round: u64,
        hashes: Vec<CandidateHash>,
    },
    Match {
        round: u64,
        number: u8,
    },
    Key {
        num_parts: usize,
        hash: CandidateHash,
    },
    Ack {
        hash: CandidateHash,
    },
    Nack,
}

impl Message {
    /// Candidates message for identifiers of one round, in the order of their numbers.
    pub fn candidates(identifiers: &[CandidateIdentifier]) -> Result<Self, CandidateKeyError> {
        let round = identifiers
            .first()
            .map(|identifier| identifier.round)
            .ok_or_else(|| CandidateKeyError::InvalidArgument("no candidates to send".into()))?;
        if identifiers.iter().enumerate().any(|(index, identifier)| {
            identifier.round != round || identifier.number as usize != index
        }) {
            return Err(CandidateKeyError::InvalidArgument(
                "candidates need to belong to one round and be numbered by position".into(),
            ));
        }

        Ok(Message::Candidates {
            round,
            hashes: identifiers.iter().map(|identifier| identifier.hash).collect(),
        })
    }

    /// Identifiers carried by a candidates message.
    pub fn identifiers(&self) -> Vec<CandidateIdentifier> {
        match self {
            Message::Candidates { round, hashes } => hashes
                .iter()
                .enumerate()
                .map(|(number, hash)| CandidateIdentifier {
                    round: *round,
                    number: number as u8,
                    hash: *hash,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CandidateKeyError> {
        let text = std::str::from_utf8(bytes).map_err(|_| malformed("not valid UTF-8"))?;
        let mut fields = text.split_ascii_whitespace();
        let command = fields.next().ok_or_else(|| malformed("empty message"))?;

        let message = match command {
            CANDIDATES => {
                let round = parse_field(fields.next(), "round")?;
                let hashes = fields
                    .by_ref()
                    .map(parse_hash)
                    .collect::<Result<Vec<_>, _>>()?;
                if hashes.is_empty() || hashes.len() > MAX_PARTS_PER_ROUND {
                    return Err(malformed(format!(
                        "{} candidates in one round",
                        hashes.len()
                    )));
                }
                Message::Candidates { round, hashes }
            }
            MATCH => Message::Match {
                round: parse_field(fields.next(), "round")?,
                number: parse_field(fields.next(), "candidate number")?,
            },
            KEY => Message::Key {
                num_parts: parse_field(fields.next(), "number of parts")?,
                hash: parse_hash(fields.next().ok_or_else(|| malformed("missing key hash"))?)?,
            },
            ACK => Message::Ack {
                hash: parse_hash(fields.next().ok_or_else(|| malformed("missing key hash"))?)?,
            },
            NACK => Message::Nack,
            other => return Err(malformed(format!("unknown command {other:?}"))),
        };

        if fields.next().is_some() {
            return Err(malformed(format!("trailing fields after {command}")));
        }

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Candidates { round, hashes } => {
                write!(f, "{CANDIDATES} {round}")?;
                for hash in hashes {
                    write!(f, " {}", hex::encode(hash))?;
                }
                Ok(())
            }
            Message::Match { round, number } => write!(f, "{MATCH} {round} {number}"),
            Message::Key { num_parts, hash } => {
                write!(f, "{KEY} {num_parts} {}", hex::encode(hash))
            }
            Message::Ack { hash } => write!(f, "{ACK} {}", hex::encode(hash)),
            Message::Nack => write!(f, "{NACK}"),
        }
    }
}

fn malformed(reason: impl Into<String>) -> CandidateKeyError {
    CandidateKeyError::MalformedCandidate(reason.into())
}

fn parse_field<T: FromStr>(field: Option<&str>, name: &str) -> Result<T, CandidateKeyError> {
    let field = field.ok_or_else(|| malformed(format!("missing {name}")))?;
    field
        .parse()
        .map_err(|_| malformed(format!("invalid {name} {field:?}")))
}

fn parse_hash(field: &str) -> Result<CandidateHash, CandidateKeyError> {
    let bytes = hex::decode(field).map_err(|err| malformed(format!("invalid hash: {err}")))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| malformed(format!("hash has {} bytes", bytes.len())))
}
