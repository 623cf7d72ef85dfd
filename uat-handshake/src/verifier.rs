// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verification of agreed keys against secrets both peers learned out-of-band.
//!
//! Diffie-Hellman alone does not protect against an attacker in the middle. When short
//! pre-shared secrets are configured on either side, both peers run a [`Verifier`] after the key
//! agreement, binding the derived authentication key to one of these secrets.
use std::fmt;

use async_trait::async_trait;
use uat_crypto::sha2::sha2_256;
use uat_crypto::{Rng, Secret, SessionKeys};
use tracing::warn;
use zeroize::Zeroizing;

use crate::channel::LineChannel;
use crate::config::HandshakeConfig;
use crate::handshake::{HandshakeError, Role};
use crate::interlock;

/// Everything a verifier gets to see of the session.
pub struct VerificationContext<'a> {
    /// Channel of the session, still open for any exchange the verifier needs.
    pub channel: &'a mut LineChannel,
    pub role: Role,
    pub keys: &'a SessionKeys,
    /// Candidate pre-shared secrets, can be empty when only the peer has some.
    pub secrets: &'a [Zeroizing<Vec<u8>>],
    pub config: &'a HandshakeConfig,
    pub rng: &'a Rng,
}

impl fmt::Debug for VerificationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationContext")
            .field("remote", &self.channel.remote_address())
            .field("role", &self.role)
            .field("secrets", &self.secrets.len())
            .finish_non_exhaustive()
    }
}

/// Hook verifying both sides hold the same authentication key and short secret.
///
/// Both sides run the verifier at the same time. Custom implementations can plug in any
/// out-of-band verification, for example comparing a short code derived from the authentication
/// key on both displays.
#[async_trait]
pub trait Verifier: fmt::Debug + Send + Sync {
    async fn verify(&self, context: VerificationContext<'_>) -> Result<(), HandshakeError>;
}

const NONCE_SIZE: usize = 16;

const TAG_SIZE: usize = 32;

const TAG_LABEL: &[u8] = b"uat-interlock-verification";

/// Number of tags every verification message carries.
pub const MAX_CANDIDATE_SECRETS: usize = 8;

const MESSAGE_SIZE: usize = NONCE_SIZE + MAX_CANDIDATE_SECRETS * TAG_SIZE;

/// Verifies the keys by interlocking tags over authentication key and short secrets.
///
/// Each side sends a nonce followed by [`MAX_CANDIDATE_SECRETS`] tags, one
/// `SHA256(label || role || authentication key || nonce || secret)` for each of its candidate
/// secrets, padded with random tags and sorted. The receiver accepts when any of its own
/// candidates reproduces one of the tags, so either side may hold several guesses. The interlock
/// prevents an attacker from trying out candidates after it saw the tags of one side.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterlockVerifier;

impl InterlockVerifier {
    fn tag(role: Role, keys: &SessionKeys, nonce: &[u8], secret: &[u8]) -> Secret<TAG_SIZE> {
        Secret::from_bytes(sha2_256(&[
            TAG_LABEL,
            &[role.to_byte()],
            keys.authentication_key.as_bytes(),
            nonce,
            secret,
        ]))
    }
}

#[async_trait]
impl Verifier for InterlockVerifier {
    async fn verify(&self, context: VerificationContext<'_>) -> Result<(), HandshakeError> {
        let nonce: [u8; NONCE_SIZE] = context.rng.random_array()?;

        if context.secrets.len() > MAX_CANDIDATE_SECRETS {
            warn!(
                candidates = context.secrets.len(),
                "only the first {MAX_CANDIDATE_SECRETS} pre-shared secrets are used"
            );
        }
        let secrets = &context.secrets[..context.secrets.len().min(MAX_CANDIDATE_SECRETS)];

        // Without any secret we still take part in the exchange so the peer is not left waiting,
        // the result can only be a mismatch though.
        let mut tags: Vec<[u8; TAG_SIZE]> = secrets
            .iter()
            .map(|secret| *Self::tag(context.role, context.keys, &nonce, secret).as_bytes())
            .collect();
        while tags.len() < MAX_CANDIDATE_SECRETS {
            tags.push(context.rng.random_array()?);
        }
        // Random padding is indistinguishable from real tags once sorted
        tags.sort_unstable();

        let mut message = Zeroizing::new(Vec::with_capacity(MESSAGE_SIZE));
        message.extend_from_slice(&nonce);
        for tag in &tags {
            message.extend_from_slice(tag);
        }

        let received = interlock::exchange(
            context.channel,
            &context.keys.authentication_key,
            &message,
            context.config,
            context.rng,
        )
        .await?;

        if secrets.is_empty() {
            return Err(HandshakeError::VerificationMismatch(
                "no pre-shared secret configured".into(),
            ));
        }
        if received.len() != MESSAGE_SIZE {
            return Err(HandshakeError::MalformedMessage(
                "verification message has invalid length".into(),
            ));
        }

        let (remote_nonce, remote_tags) = received.split_at(NONCE_SIZE);
        let peer_role = context.role.peer();
        let matched = secrets.iter().any(|secret| {
            let expected = Self::tag(peer_role, context.keys, remote_nonce, secret);
            remote_tags.chunks_exact(TAG_SIZE).any(|tag| {
                <[u8; TAG_SIZE]>::try_from(tag)
                    .is_ok_and(|tag| Secret::from_bytes(tag) == expected)
            })
        });

        if matched {
            Ok(())
        } else {
            Err(HandshakeError::VerificationMismatch(
                "no pre-shared secret matches".into(),
            ))
        }
    }
}
