// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authentication events API.
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use uat_crypto::Secret;
use uat_crypto::key_agreement::DERIVED_KEY_SIZE;

use crate::channel::LineChannel;
use crate::handshake::{HandshakeError, Role};

/// Capacity of event channels created for single sessions.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted during handshake sessions.
///
/// Every session emits any number of progress events followed by exactly one outcome event.
#[derive(Clone, Debug)]
pub enum AuthenticationEvent {
    /// The session advanced by one step.
    ///
    /// `max_steps` is unknown until both sides told whether they want to verify the keys.
    Progress {
        remote: String,
        step: u8,
        max_steps: Option<u8>,
        message: String,
    },

    /// Both peers agreed on keys and, if requested, verified them.
    Success(AuthenticationSuccess),

    /// The session failed, the channel was closed.
    Failure {
        remote: String,
        error: Arc<HandshakeError>,
        message: String,
    },
}

impl AuthenticationEvent {
    pub fn remote(&self) -> &str {
        match self {
            AuthenticationEvent::Progress { remote, .. } => remote,
            AuthenticationEvent::Success(success) => &success.remote,
            AuthenticationEvent::Failure { remote, .. } => remote,
        }
    }

    /// Returns true for success and failure events.
    pub fn is_outcome(&self) -> bool {
        !matches!(self, AuthenticationEvent::Progress { .. })
    }
}

/// Result of a successful handshake.
#[derive(Clone, Debug)]
pub struct AuthenticationSuccess {
    pub remote: String,
    pub role: Role,
    pub session_key: Secret<DERIVED_KEY_SIZE>,
    pub authentication_key: Secret<DERIVED_KEY_SIZE>,

    /// Application parameter sent by the initiator.
    pub param: Option<String>,

    /// Channel of the session, only present when the session was configured to keep it.
    pub channel: Option<ReusableChannel>,
}

/// Channel handed over after a successful handshake.
///
/// Events are delivered to every subscriber, only the first one to call [`take`](Self::take)
/// receives the channel.
#[derive(Clone, Debug)]
pub struct ReusableChannel(Arc<Mutex<Option<LineChannel>>>);

impl ReusableChannel {
    pub(crate) fn new(channel: LineChannel) -> Self {
        Self(Arc::new(Mutex::new(Some(channel))))
    }

    pub async fn take(&self) -> Option<LineChannel> {
        self.0.lock().await.take()
    }
}

/// Sender side of authentication events.
pub type EventSender = broadcast::Sender<AuthenticationEvent>;

/// Receiver side of authentication events.
pub type EventReceiver = broadcast::Receiver<AuthenticationEvent>;
