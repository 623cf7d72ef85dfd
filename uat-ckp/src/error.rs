// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io;

use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum CandidateKeyError {
    #[error("not enough matching candidates: {0}")]
    NoMatch(String),

    #[error("malformed candidate message: {0}")]
    MalformedCandidate(String),

    #[error("remote acknowledged a key we never generated")]
    UnknownKey,

    #[error("remote aborted the protocol")]
    RemoteAborted,

    #[error("datagram channel failed: {0}")]
    Channel(#[from] io::Error),

    #[error("invalid state: {0}")]
    State(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("receive loop failed: {0}")]
    Task(#[from] JoinError),
}
