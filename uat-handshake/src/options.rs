// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uat_crypto::key_agreement::SECRET_KEY_SIZE;
use uat_crypto::{COMMITMENT_SIZE, KeyAgreement, Rng, Secret, commitment};
use zeroize::Zeroizing;

use crate::config::HandshakeConfig;
use crate::handshake::ProtocolCommandHandler;
use crate::verifier::{InterlockVerifier, Verifier};

/// Everything a handshake session needs besides its channel.
///
/// Sessions hold on to their own copy of the options for their whole lifetime, changing options
/// later only affects sessions started afterwards.
#[derive(Clone)]
pub struct HandshakeOptions {
    pub(crate) config: HandshakeConfig,
    pub(crate) rng: Arc<Rng>,
    pub(crate) preshared_secrets: Arc<PresharedSecrets>,
    pub(crate) peer_commitment: Option<[u8; COMMITMENT_SIZE]>,
    pub(crate) static_secret: Option<Secret<SECRET_KEY_SIZE>>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) command_handlers: HashMap<String, Arc<dyn ProtocolCommandHandler>>,
}

impl HandshakeOptions {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            rng: Arc::new(Rng::default()),
            preshared_secrets: Arc::default(),
            peer_commitment: None,
            static_secret: None,
            verifier: Arc::new(InterlockVerifier),
            command_handlers: HashMap::new(),
        }
    }

    pub fn with_rng(mut self, rng: Rng) -> Self {
        self.rng = Arc::new(rng);
        self
    }

    /// Short secrets learned over an out-of-band channel, any of them may be the one the peer
    /// holds.
    ///
    /// When either side has secrets both sides verify the agreed keys against them. The secrets
    /// are consumed by the first failed verification: a peer which saw our verification message
    /// could brute-force a short secret offline. All later sessions with these options then fail
    /// verification until new secrets are set.
    pub fn with_preshared_secrets(mut self, secrets: Vec<Vec<u8>>) -> Self {
        self.preshared_secrets = Arc::new(PresharedSecrets::new(secrets));
        self
    }

    /// Commitment to the public key the peer is expected to present.
    pub fn with_peer_commitment(mut self, commitment: [u8; COMMITMENT_SIZE]) -> Self {
        self.peer_commitment = Some(commitment);
        self
    }

    /// Long-term secret used instead of a fresh key pair for every session.
    pub fn with_static_secret(mut self, secret: Secret<SECRET_KEY_SIZE>) -> Self {
        self.static_secret = Some(secret);
        self
    }

    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Arc::new(verifier);
        self
    }

    /// Hands sessions starting with the given command word over to the handler.
    pub fn with_command_handler(
        mut self,
        command: &str,
        handler: impl ProtocolCommandHandler + 'static,
    ) -> Self {
        self.command_handlers
            .insert(command.to_string(), Arc::new(handler));
        self
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut HandshakeConfig {
        &mut self.config
    }

    /// True when secrets were configured, even if they are consumed already.
    pub fn has_preshared_secrets(&self) -> bool {
        !self.preshared_secrets.secrets.is_empty()
    }

    pub fn preshared_secrets_consumed(&self) -> bool {
        self.preshared_secrets.is_consumed()
    }

    /// Commitment to our static public key which can be published ahead of time.
    pub fn permanent_commitment(&self) -> Option<[u8; COMMITMENT_SIZE]> {
        let secret = self.static_secret.as_ref()?;
        let public_key = KeyAgreement::from_static_secret(secret).public_key()?;
        Some(commitment(&public_key))
    }
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self::new(HandshakeConfig::default())
    }
}

impl fmt::Debug for HandshakeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeOptions")
            .field("config", &self.config)
            .field("preshared_secrets", &self.preshared_secrets)
            .field("peer_commitment", &self.peer_commitment.map(hex::encode))
            .field("static_secret", &self.static_secret.is_some())
            .field("verifier", &self.verifier)
            .field(
                "command_handlers",
                &self.command_handlers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Short secrets shared by all copies of the options they were set on.
#[derive(Default)]
pub(crate) struct PresharedSecrets {
    secrets: Vec<Zeroizing<Vec<u8>>>,
    consumed: AtomicBool,
}

impl PresharedSecrets {
    fn new(secrets: Vec<Vec<u8>>) -> Self {
        Self {
            secrets: secrets.into_iter().map(Zeroizing::new).collect(),
            consumed: AtomicBool::new(false),
        }
    }

    /// Secrets still usable for verification, none once they are consumed.
    pub(crate) fn available(&self) -> &[Zeroizing<Vec<u8>>] {
        if self.is_consumed() {
            &[]
        } else {
            &self.secrets
        }
    }

    /// Marks the secrets as used up, returns true for the first call only.
    pub(crate) fn consume(&self) -> bool {
        !self.secrets.is_empty() && !self.consumed.swap(true, Ordering::SeqCst)
    }

    fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for PresharedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresharedSecrets")
            .field("count", &self.secrets.len())
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::HandshakeOptions;

    #[test]
    fn secrets_are_consumed_once_for_all_copies() {
        let options = HandshakeOptions::default().with_preshared_secrets(vec![b"1234".to_vec()]);
        let snapshot = options.clone();
        assert_eq!(snapshot.preshared_secrets.available().len(), 1);

        assert!(snapshot.preshared_secrets.consume());
        assert!(!options.preshared_secrets.consume());
        assert!(options.preshared_secrets_consumed());
        assert!(options.preshared_secrets.available().is_empty());
        // Verification is still requested from the peer
        assert!(options.has_preshared_secrets());

        // New secrets start out fresh
        let options = options.with_preshared_secrets(vec![b"5678".to_vec()]);
        assert!(!options.preshared_secrets_consumed());
        assert_eq!(options.preshared_secrets.available().len(), 1);
    }

    #[test]
    fn nothing_to_consume_without_secrets() {
        let options = HandshakeOptions::default();
        assert!(!options.preshared_secrets.consume());
        assert!(!options.preshared_secrets_consumed());
    }
}
