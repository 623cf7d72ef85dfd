// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(doc, deny(rustdoc::broken_intra_doc_links))]

//! Authenticated pairing of two devices over an insecure, connection-oriented channel.
//!
//! A responder (usually a [`HostServer`]) and an initiator run the host protocol [handshake]: an
//! unauthenticated Diffie-Hellman key agreement over a line-based text protocol, optionally
//! followed by a verification step binding the agreed keys to a short secret both devices learned
//! out-of-band. The default [`InterlockVerifier`] uses the [interlock protocol](interlock) for
//! this, which keeps an attacker in the middle from adapting its messages to what it learned from
//! either side.
//!
//! Sessions report their progress and outcome as [`AuthenticationEvent`]s. Failures of one session
//! never affect any other session or the accept loop of the server.
pub mod channel;
pub mod config;
pub mod events;
pub mod handshake;
pub mod interlock;
mod options;
pub mod server;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod verifier;

pub use channel::{Channel, ChannelError, ChannelListener, LineChannel};
pub use config::HandshakeConfig;
pub use events::{AuthenticationEvent, AuthenticationSuccess, ReusableChannel};
pub use handshake::{
    Handshake, HandshakeError, ProtocolCommandHandler, ResponderOutcome, Role,
    start_authentication_with,
};
pub use interlock::{Interlock, InterlockError};
pub use options::HandshakeOptions;
pub use server::{HostServer, ServerError};
pub use verifier::{InterlockVerifier, VerificationContext, Verifier};
