// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(doc, deny(rustdoc::broken_intra_doc_links))]

//! Candidate key protocol for pairing devices which observe the same physical phenomenon.
//!
//! Two devices shaken together, for example, record correlated accelerometer readings. Each of
//! them derives several candidate key parts per round from its readings and multicasts only
//! hashes of these parts over a connectionless [datagram channel](datagram). Parts both devices
//! derived independently match, and once enough rounds matched both assemble the same key from
//! them without ever transmitting it.
//!
//! [`CandidateKeyProtocol`] holds the matching table, [`CandidateKeyNode`] drives it over a
//! [`DatagramChannel`] and reports the outcome for every remote as a [`CandidateKeyEvent`].
pub mod config;
pub mod datagram;
mod error;
pub mod events;
pub mod message;
pub mod node;
pub mod protocol;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use config::CandidateKeyConfig;
pub use datagram::{Datagram, DatagramChannel, DatagramHub, DatagramReceiver, UdpChannel};
pub use error::CandidateKeyError;
pub use events::CandidateKeyEvent;
pub use message::Message;
pub use node::CandidateKeyNode;
pub use protocol::{CandidateIdentifier, CandidateKey, CandidateKeyProtocol};
