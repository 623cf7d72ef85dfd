// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for handshake sessions and the host server.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default timeout for every blocking read during a handshake.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum length of a single protocol line in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// Default number of interlock rounds.
pub const DEFAULT_INTERLOCK_ROUNDS: usize = 2;

/// Default upper bound for the message length a peer may announce before an interlock exchange.
pub const DEFAULT_MAX_INTERLOCK_MESSAGE_LEN: usize = 4096;

/// Configuration parameters of a handshake session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Maximum time to wait for the next line from the remote peer.
    pub timeout: Duration,

    /// Hand the channel over to the success event instead of closing it.
    pub keep_connected: bool,

    /// Lines longer than this are treated as malformed input.
    pub max_line_length: usize,

    /// Number of rounds each interlock exchange is split into, at least 2.
    pub interlock_rounds: usize,

    /// Upper bound for the message length announced by the peer with `ILCKINIT`.
    pub max_interlock_message_len: usize,

    /// Reject interlock messages which carry our own initialisation vector, which happens when an
    /// attacker reflects our parts back to us.
    pub mirror_attack_protection: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            keep_connected: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            interlock_rounds: DEFAULT_INTERLOCK_ROUNDS,
            max_interlock_message_len: DEFAULT_MAX_INTERLOCK_MESSAGE_LEN,
            mirror_attack_protection: true,
        }
    }
}
