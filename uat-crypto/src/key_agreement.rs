// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unauthenticated Diffie-Hellman key agreement (X25519) between two endpoints.
//!
//! A [`KeyAgreement`] session moves through three states: first a local key pair is generated,
//! then the remote public key is added exactly once and only then the shared secret becomes
//! available. The raw shared secret is never meant to be used as a symmetric key, callers derive
//! [`SessionKeys`] from it instead.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::hkdf::{HkdfError, hkdf};
use crate::rng::{Rng, RngError};
use crate::secret::Secret;
use crate::sha2::sha2_256;

/// 256-bit secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// 256-bit public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of both derived keys.
pub const DERIVED_KEY_SIZE: usize = 32;

/// Size of a pre-authentication commitment.
pub const COMMITMENT_SIZE: usize = 32;

const SESSION_KEY_INFO: &[u8] = b"uat-session-key";

const AUTHENTICATION_KEY_INFO: &[u8] = b"uat-authentication-key";

const COMMITMENT_LABEL: &[u8] = b"uat-public-key-commitment";

/// Public Curve25519 value exchanged during key agreement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyAgreementError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = value.try_into().map_err(|_| {
            KeyAgreementError::InvalidPeerKey(format!(
                "expected {PUBLIC_KEY_SIZE} bytes, got {}",
                value.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl FromStr for PublicKey {
    type Err = KeyAgreementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value)
            .map_err(|err| KeyAgreementError::InvalidPeerKey(err.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Pre-authentication commitment to a public key.
///
/// Publishing the commitment over a trusted channel before the key agreement takes place lets the
/// peer reject any other public key presented during the handshake.
pub fn commitment(public_key: &PublicKey) -> [u8; COMMITMENT_SIZE] {
    sha2_256(&[COMMITMENT_LABEL, public_key.as_bytes()])
}

/// Keys derived from the raw Diffie-Hellman output.
///
/// Both are derived with distinct labels so revealing one never reveals the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    pub session_key: Secret<DERIVED_KEY_SIZE>,
    pub authentication_key: Secret<DERIVED_KEY_SIZE>,
}

struct LocalKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

/// State of one Diffie-Hellman key agreement.
pub struct KeyAgreement {
    local: Option<LocalKeyPair>,
    remote: Option<PublicKey>,
    shared_secret: Option<Secret<SECRET_KEY_SIZE>>,
    wiped: bool,
}

impl KeyAgreement {
    pub fn new() -> Self {
        Self {
            local: None,
            remote: None,
            shared_secret: None,
            wiped: false,
        }
    }

    /// Session with a key pair derived from a long-term secret.
    ///
    /// The key pair counts as already generated, its public key (and commitment) can be
    /// published ahead of any handshake.
    pub fn from_static_secret(secret: &Secret<SECRET_KEY_SIZE>) -> Self {
        let mut session = Self::new();
        session.local = Some(LocalKeyPair::from_bytes(*secret.as_bytes()));
        session
    }

    /// Generates the local ephemeral key pair and returns its public value.
    pub fn generate_key_pair(&mut self, rng: &Rng) -> Result<PublicKey, KeyAgreementError> {
        self.ensure_not_wiped()?;
        if self.local.is_some() {
            return Err(KeyAgreementError::State("key pair already generated"));
        }
        let key_pair = LocalKeyPair::from_bytes(rng.random_array()?);
        let public = key_pair.public;
        self.local = Some(key_pair);
        Ok(public)
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.local.as_ref().map(|key_pair| key_pair.public)
    }

    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote
    }

    /// Adds the peer's public value and computes the shared secret.
    ///
    /// Low-order points which would force a predictable shared secret are rejected.
    pub fn add_remote_public_key(&mut self, bytes: &[u8]) -> Result<(), KeyAgreementError> {
        self.ensure_not_wiped()?;
        let Some(local) = self.local.as_ref() else {
            return Err(KeyAgreementError::State("key pair not generated yet"));
        };
        if self.remote.is_some() {
            return Err(KeyAgreementError::State("remote public key already added"));
        }

        let remote = PublicKey::try_from(bytes)?;
        let shared = local
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(*remote.as_bytes()));
        if !shared.was_contributory() {
            return Err(KeyAgreementError::InvalidPeerKey(
                "non-contributory public key".into(),
            ));
        }

        self.shared_secret = Some(Secret::from_bytes(*shared.as_bytes()));
        self.remote = Some(remote);
        Ok(())
    }

    /// Raw Diffie-Hellman output.
    pub fn shared_secret(&self) -> Result<&Secret<SECRET_KEY_SIZE>, KeyAgreementError> {
        self.ensure_not_wiped()?;
        self.shared_secret
            .as_ref()
            .ok_or(KeyAgreementError::State("remote public key not added yet"))
    }

    /// Derives the session and authentication key with HKDF-SHA256.
    ///
    /// Both public keys, sorted, make the salt so both sides arrive at the same keys regardless of
    /// their role.
    pub fn derive_keys(&self) -> Result<SessionKeys, KeyAgreementError> {
        let shared_secret = self.shared_secret()?;
        let (Some(local), Some(remote)) = (self.public_key(), self.remote) else {
            return Err(KeyAgreementError::State("remote public key not added yet"));
        };

        let (first, second) = if local <= remote {
            (local, remote)
        } else {
            (remote, local)
        };
        let mut salt = Vec::with_capacity(2 * PUBLIC_KEY_SIZE);
        salt.extend_from_slice(first.as_bytes());
        salt.extend_from_slice(second.as_bytes());

        let session_key = hkdf(&salt, shared_secret.as_bytes(), Some(SESSION_KEY_INFO))?;
        let authentication_key =
            hkdf(&salt, shared_secret.as_bytes(), Some(AUTHENTICATION_KEY_INFO))?;

        Ok(SessionKeys {
            session_key: Secret::from_bytes(session_key),
            authentication_key: Secret::from_bytes(authentication_key),
        })
    }

    /// Drops all secret material, every further operation fails.
    pub fn wipe(&mut self) {
        self.local = None;
        self.shared_secret = None;
        self.wiped = true;
    }

    fn ensure_not_wiped(&self) -> Result<(), KeyAgreementError> {
        if self.wiped {
            return Err(KeyAgreementError::State("key agreement was wiped"));
        }
        Ok(())
    }
}

impl Default for KeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAgreement")
            .field("public_key", &self.public_key())
            .field("remote_public_key", &self.remote)
            .field("wiped", &self.wiped)
            .finish_non_exhaustive()
    }
}

impl LocalKeyPair {
    fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping happens inside x25519-dalek.
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from_bytes(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }
}

#[derive(Debug, Error)]
pub enum KeyAgreementError {
    #[error("invalid key agreement state: {0}")]
    State(&'static str),

    #[error("invalid peer public key: {0}")]
    InvalidPeerKey(String),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::rng::Rng;
    use crate::secret::Secret;

    use super::{KeyAgreement, KeyAgreementError, PublicKey, commitment};

    fn agree(rng: &Rng) -> (KeyAgreement, KeyAgreement) {
        let mut alice = KeyAgreement::new();
        let mut bob = KeyAgreement::new();
        let alice_public = alice.generate_key_pair(rng).unwrap();
        let bob_public = bob.generate_key_pair(rng).unwrap();
        alice.add_remote_public_key(bob_public.as_bytes()).unwrap();
        bob.add_remote_public_key(alice_public.as_bytes()).unwrap();
        (alice, bob)
    }

    #[test]
    fn diffie_hellman() {
        let rng = Rng::from_seed([1; 32]);
        let (alice, bob) = agree(&rng);

        assert_eq!(alice.shared_secret().unwrap(), bob.shared_secret().unwrap());
        assert_eq!(alice.derive_keys().unwrap(), bob.derive_keys().unwrap());
    }

    #[test]
    fn derived_keys_are_separated() {
        let rng = Rng::from_seed([2; 32]);
        let (alice, _) = agree(&rng);
        let keys = alice.derive_keys().unwrap();

        assert_ne!(keys.session_key, keys.authentication_key);
        assert_ne!(keys.session_key.as_bytes(), alice.shared_secret().unwrap().as_bytes());
    }

    #[test]
    fn sessions_use_fresh_keys() {
        let rng = Rng::from_seed([3; 32]);
        let (first, _) = agree(&rng);
        let (second, _) = agree(&rng);

        assert_ne!(first.public_key(), second.public_key());
        assert_ne!(
            first.derive_keys().unwrap().session_key,
            second.derive_keys().unwrap().session_key
        );
    }

    #[test]
    fn misuse_is_a_state_error() {
        let rng = Rng::from_seed([4; 32]);
        let mut session = KeyAgreement::new();

        assert_matches!(session.shared_secret(), Err(KeyAgreementError::State(_)));
        assert_matches!(
            session.add_remote_public_key(&[9; 32]),
            Err(KeyAgreementError::State(_))
        );

        session.generate_key_pair(&rng).unwrap();
        assert_matches!(
            session.generate_key_pair(&rng),
            Err(KeyAgreementError::State(_))
        );
        assert_matches!(session.derive_keys(), Err(KeyAgreementError::State(_)));

        let mut peer = KeyAgreement::new();
        let peer_public = peer.generate_key_pair(&rng).unwrap();
        session.add_remote_public_key(peer_public.as_bytes()).unwrap();
        assert_matches!(
            session.add_remote_public_key(peer_public.as_bytes()),
            Err(KeyAgreementError::State(_))
        );
    }

    #[test]
    fn rejects_invalid_peer_keys() {
        let rng = Rng::from_seed([5; 32]);
        let mut session = KeyAgreement::new();
        session.generate_key_pair(&rng).unwrap();

        assert_matches!(
            session.add_remote_public_key(&[]),
            Err(KeyAgreementError::InvalidPeerKey(_))
        );
        assert_matches!(
            session.add_remote_public_key(&[1; 31]),
            Err(KeyAgreementError::InvalidPeerKey(_))
        );

        // The identity point yields an all-zero shared secret.
        assert_matches!(
            session.add_remote_public_key(&[0; 32]),
            Err(KeyAgreementError::InvalidPeerKey(_))
        );
        assert!(session.remote_public_key().is_none());
    }

    #[test]
    fn wiped_session_is_unusable() {
        let rng = Rng::from_seed([6; 32]);
        let (mut alice, _) = agree(&rng);
        alice.wipe();

        assert!(alice.public_key().is_none());
        assert_matches!(alice.shared_secret(), Err(KeyAgreementError::State(_)));
        assert_matches!(alice.derive_keys(), Err(KeyAgreementError::State(_)));
        assert_matches!(
            alice.generate_key_pair(&rng),
            Err(KeyAgreementError::State(_))
        );
    }

    #[test]
    fn static_key_commitment() {
        let rng = Rng::from_seed([7; 32]);
        let secret = Secret::from_bytes(rng.random_array().unwrap());

        let first = KeyAgreement::from_static_secret(&secret);
        let second = KeyAgreement::from_static_secret(&secret);
        let public_key = first.public_key().unwrap();
        assert_eq!(Some(public_key), second.public_key());

        let mut other = KeyAgreement::new();
        let other_public = other.generate_key_pair(&rng).unwrap();
        assert_eq!(commitment(&public_key), commitment(&second.public_key().unwrap()));
        assert_ne!(commitment(&public_key), commitment(&other_public));
    }

    #[test]
    fn public_key_hex_encoding() {
        let rng = Rng::from_seed([8; 32]);
        let mut session = KeyAgreement::new();
        let public_key = session.generate_key_pair(&rng).unwrap();

        let parsed: PublicKey = public_key.to_hex().parse().unwrap();
        assert_eq!(parsed, public_key);
        assert_matches!(
            "not hex".parse::<PublicKey>(),
            Err(KeyAgreementError::InvalidPeerKey(_))
        );
    }
}
