// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use tokio::sync::broadcast;
use uat_crypto::Secret;

use crate::error::CandidateKeyError;
use crate::protocol::KEY_SIZE;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by a candidate key node, tagged with the remote they concern.
///
/// For every remote there are any number of progress events followed by at most one outcome.
#[derive(Clone, Debug)]
pub enum CandidateKeyEvent {
    /// Another round matched.
    Progress {
        remote: String,
        matches: usize,
        required: usize,
    },

    /// Both nodes agreed on a key.
    Success {
        remote: String,
        key: Secret<KEY_SIZE>,
    },

    Failure {
        remote: String,
        error: Arc<CandidateKeyError>,
    },
}

impl CandidateKeyEvent {
    pub fn remote(&self) -> &str {
        match self {
            CandidateKeyEvent::Progress { remote, .. } => remote,
            CandidateKeyEvent::Success { remote, .. } => remote,
            CandidateKeyEvent::Failure { remote, .. } => remote,
        }
    }

    pub fn is_outcome(&self) -> bool {
        !matches!(self, CandidateKeyEvent::Progress { .. })
    }
}

pub type EventSender = broadcast::Sender<CandidateKeyEvent>;

pub type EventReceiver = broadcast::Receiver<CandidateKeyEvent>;
