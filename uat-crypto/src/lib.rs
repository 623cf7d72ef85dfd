// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(doc, deny(rustdoc::broken_intra_doc_links))]

//! Cryptographic building blocks for authenticated device pairing.
//!
//! Two devices without any prior relationship first run an unauthenticated Diffie-Hellman
//! [key agreement](key_agreement) and derive separate session and authentication keys from its
//! output. The authentication key is later bound to a short secret which both devices learned over
//! an out-of-band channel, for example with the interlock protocol which relies on the
//! [block cipher](cipher) in this crate.
//!
//! All key material lives in [`Secret`] containers which are zeroized on drop and never show up in
//! debug output. Randomness is drawn from an explicit [`Rng`] instance handed into the components
//! which need it.
pub mod cipher;
pub mod hkdf;
pub mod key_agreement;
pub mod rng;
pub mod secret;
pub mod sha2;

pub use cipher::{BLOCK_SIZE, BlockCipher, CipherError};
pub use key_agreement::{
    COMMITMENT_SIZE, KeyAgreement, KeyAgreementError, PublicKey, SessionKeys, commitment,
};
pub use rng::{Rng, RngError};
pub use secret::Secret;
