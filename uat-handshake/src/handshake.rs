// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host protocol handshake between a responder (the side which accepted the channel) and an
//! initiator.
//!
//! ```text
//! responder -> HELO OpenUAT Authentication
//! initiator -> AUTHREQ <hexPublicKey> [VERIFY] [PARAM <parameter>]
//! responder -> AUTHACK <hexPublicKey> [VERIFY]
//! (verification exchange, only when VERIFY was sent by either side)
//! both      -> VERIFIED | VERIFYFAIL <reason>
//! ```
//!
//! Both sides derive a session and an authentication key from the Diffie-Hellman output. If
//! either side holds pre-shared secrets both sides run the configured [`Verifier`] before the
//! session counts as authenticated.
//!
//! [`Verifier`]: crate::verifier::Verifier
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, debug_span, info, warn};
use uat_crypto::{KeyAgreement, KeyAgreementError, PublicKey, RngError, SessionKeys, commitment};

use crate::channel::{Channel, ChannelError, LineChannel};
use crate::events::{
    AuthenticationEvent, AuthenticationSuccess, EVENT_CHANNEL_CAPACITY, EventReceiver, EventSender,
    ReusableChannel,
};
use crate::interlock::InterlockError;
use crate::options::HandshakeOptions;
use crate::verifier::VerificationContext;

/// Greeting sent by the responder as soon as the channel is open.
pub const GREETING: &str = "HELO OpenUAT Authentication";

pub const AUTH_REQUEST: &str = "AUTHREQ";

pub const AUTH_ACK: &str = "AUTHACK";

pub const VERIFIED: &str = "VERIFIED";

pub const VERIFY_FAILED: &str = "VERIFYFAIL";

/// Prefix of the line a responder sends before closing the channel on malformed input.
pub const PROTOCOL_ERROR: &str = "Protocol error:";

const VERIFY_FLAG: &str = "VERIFY";

const PARAM_FLAG: &str = " PARAM ";

/// Side of a handshake session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Side which opened the channel.
    Initiator,

    /// Side which accepted the channel and sends the greeting.
    Responder,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    GreetingSent,
    GreetingReceived,
    KeyExchanged,
    Verifying,
    Succeeded,
    Failed,
}

/// Handler for sessions which do not start with an authentication request.
///
/// Handlers are registered for a command word. When the first line an initiator sends after the
/// greeting starts with that word, the whole session is handed over to the handler.
#[async_trait]
pub trait ProtocolCommandHandler: fmt::Debug + Send + Sync {
    async fn handle(&self, line: String, channel: LineChannel) -> Result<(), HandshakeError>;
}

/// How a session accepted by a responder ended.
#[derive(Debug)]
pub enum ResponderOutcome {
    Authenticated(AuthenticationSuccess),

    /// Session was handed over to a protocol command handler.
    Delegated { command: String },
}

enum Responded {
    Authenticated {
        keys: SessionKeys,
        param: Option<String>,
    },
    Command(String),
}

/// State machine of one handshake session.
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    remote: String,
    options: Arc<HandshakeOptions>,
    events: EventSender,
    key_agreement: KeyAgreement,
    verify: bool,
    /// Whether the peer told us if it wants to verify.
    verify_known: bool,
    step: u8,
}

impl Handshake {
    fn new(role: Role, remote: String, options: Arc<HandshakeOptions>, events: EventSender) -> Self {
        let key_agreement = match &options.static_secret {
            Some(secret) => KeyAgreement::from_static_secret(secret),
            None => KeyAgreement::new(),
        };

        Self {
            role,
            state: HandshakeState::Idle,
            remote,
            options,
            events,
            key_agreement,
            verify: false,
            verify_known: false,
            step: 0,
        }
    }

    /// Runs the responder side of a session on the current task.
    ///
    /// Progress and outcome are reported on `events` as well.
    pub async fn accept<C: Channel>(
        channel: C,
        options: Arc<HandshakeOptions>,
        events: EventSender,
    ) -> Result<ResponderOutcome, Arc<HandshakeError>> {
        let remote = channel.remote_address();
        let mut lines = LineChannel::new(
            channel,
            options.config.max_line_length,
            options.config.timeout,
        );
        let mut handshake = Handshake::new(Role::Responder, remote.clone(), options, events);

        let span = debug_span!("handshake", role = %Role::Responder, %remote);
        async move {
            match handshake.respond(&mut lines).await {
                Ok(Responded::Authenticated { keys, param }) => handshake
                    .succeed(keys, param, lines)
                    .await
                    .map(ResponderOutcome::Authenticated),
                Ok(Responded::Command(line)) => handshake.delegate(line, lines).await,
                Err(err) => Err(handshake.fail(err, lines).await),
            }
        }
        .instrument(span)
        .await
    }

    /// Runs the initiator side of a session on the current task.
    ///
    /// The optional application parameter is passed on to the responder.
    pub async fn initiate<C: Channel>(
        channel: C,
        options: Arc<HandshakeOptions>,
        param: Option<String>,
        events: EventSender,
    ) -> Result<AuthenticationSuccess, Arc<HandshakeError>> {
        let remote = channel.remote_address();
        let mut lines = LineChannel::new(
            channel,
            options.config.max_line_length,
            options.config.timeout,
        );
        let mut handshake = Handshake::new(Role::Initiator, remote.clone(), options, events);

        let span = debug_span!("handshake", role = %Role::Initiator, %remote);
        async move {
            match handshake.request(&mut lines, param.as_deref()).await {
                Ok(keys) => handshake.succeed(keys, param, lines).await,
                Err(err) => Err(handshake.fail(err, lines).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn respond(&mut self, lines: &mut LineChannel) -> Result<Responded, HandshakeError> {
        lines.write_line(GREETING).await?;
        self.transition(HandshakeState::GreetingSent)?;
        self.verify = self.options.has_preshared_secrets();
        self.progress("greeting sent");

        let line = lines.read_line().await?;
        if !line.starts_with(AUTH_REQUEST) {
            let command = line.split(' ').next().unwrap_or_default();
            if self.options.command_handlers.contains_key(command) {
                return Ok(Responded::Command(line));
            }
            return Err(HandshakeError::MalformedMessage(format!(
                "expected {AUTH_REQUEST}, got '{line}'"
            )));
        }

        let request = AuthLine::parse(&line, AUTH_REQUEST)?;
        self.verify |= request.verify;
        self.verify_known = true;
        self.add_remote_public_key(&request.public_key)?;
        self.progress("public key received");

        let public_key = self.local_public_key()?;
        let ack = if self.verify {
            format!("{AUTH_ACK} {public_key} {VERIFY_FLAG}")
        } else {
            format!("{AUTH_ACK} {public_key}")
        };
        lines.write_line(&ack).await?;
        self.progress("public key sent");

        let keys = self.derive_keys()?;
        if self.verify {
            self.verify_keys(lines, &keys).await?;
        }

        Ok(Responded::Authenticated {
            keys,
            param: request.param,
        })
    }

    async fn request(
        &mut self,
        lines: &mut LineChannel,
        param: Option<&str>,
    ) -> Result<SessionKeys, HandshakeError> {
        if param.is_some_and(|param| param.contains(['\n', '\r'])) {
            return Err(HandshakeError::State(
                "parameter must not contain line breaks".into(),
            ));
        }

        let line = lines.read_line().await?;
        if line != GREETING {
            return Err(unexpected_line(&line, "greeting"));
        }
        self.transition(HandshakeState::GreetingReceived)?;
        self.verify = self.options.has_preshared_secrets();
        self.progress("greeting received");

        let public_key = self.local_public_key()?;
        let mut request = format!("{AUTH_REQUEST} {public_key}");
        if self.verify {
            request.push(' ');
            request.push_str(VERIFY_FLAG);
        }
        if let Some(param) = param {
            request.push_str(PARAM_FLAG);
            request.push_str(param);
        }
        lines.write_line(&request).await?;
        self.progress("public key sent");

        let line = lines.read_line().await?;
        if !line.starts_with(AUTH_ACK) {
            return Err(unexpected_line(&line, AUTH_ACK));
        }
        let ack = AuthLine::parse(&line, AUTH_ACK)?;
        self.verify |= ack.verify;
        self.verify_known = true;
        self.add_remote_public_key(&ack.public_key)?;
        self.progress("public key received");

        let keys = self.derive_keys()?;
        if self.verify {
            self.verify_keys(lines, &keys).await?;
        }

        Ok(keys)
    }

    fn local_public_key(&mut self) -> Result<PublicKey, HandshakeError> {
        match self.key_agreement.public_key() {
            Some(public_key) => Ok(public_key),
            None => Ok(self.key_agreement.generate_key_pair(&self.options.rng)?),
        }
    }

    fn add_remote_public_key(&mut self, bytes: &[u8]) -> Result<(), HandshakeError> {
        self.local_public_key()?;
        self.key_agreement.add_remote_public_key(bytes)?;

        if let Some(expected) = self.options.peer_commitment {
            let remote = self
                .key_agreement
                .remote_public_key()
                .ok_or_else(|| HandshakeError::State("remote public key missing".into()))?;
            if commitment(&remote) != expected {
                return Err(HandshakeError::VerificationMismatch(
                    "public key does not match pre-authentication commitment".into(),
                ));
            }
        }

        Ok(())
    }

    fn derive_keys(&mut self) -> Result<SessionKeys, HandshakeError> {
        let keys = self.key_agreement.derive_keys()?;
        self.transition(HandshakeState::KeyExchanged)?;
        self.progress("shared secret computed");
        Ok(keys)
    }

    async fn verify_keys(
        &mut self,
        lines: &mut LineChannel,
        keys: &SessionKeys,
    ) -> Result<(), HandshakeError> {
        self.transition(HandshakeState::Verifying)?;
        debug!("verifying keys");

        let options = self.options.clone();
        let result = options
            .verifier
            .verify(VerificationContext {
                channel: &mut *lines,
                role: self.role,
                keys,
                secrets: options.preshared_secrets.available(),
                config: &options.config,
                rng: &options.rng,
            })
            .await;

        if let Err(err) = result {
            if options.preshared_secrets.consume() {
                warn!("pre-shared secrets consumed by failed verification");
            }
            // Let the peer know, the channel might already be unusable though.
            let _ = lines.write_line(&format!("{VERIFY_FAILED} {err}")).await;
            return Err(err);
        }

        lines.write_line(VERIFIED).await?;
        let status = lines.read_line().await?;
        if status != VERIFIED {
            return Err(unexpected_line(&status, VERIFIED));
        }

        self.progress("keys verified");
        Ok(())
    }

    async fn succeed(
        &mut self,
        keys: SessionKeys,
        param: Option<String>,
        lines: LineChannel,
    ) -> Result<AuthenticationSuccess, Arc<HandshakeError>> {
        if let Err(err) = self.transition(HandshakeState::Succeeded) {
            return Err(self.fail(err, lines).await);
        }
        self.key_agreement.wipe();

        let channel = if self.options.config.keep_connected {
            Some(ReusableChannel::new(lines))
        } else {
            if let Err(err) = lines.close().await {
                debug!(%err, "closing channel failed");
            }
            None
        };

        let success = AuthenticationSuccess {
            remote: self.remote.clone(),
            role: self.role,
            session_key: keys.session_key,
            authentication_key: keys.authentication_key,
            param,
            channel,
        };

        info!(verified = self.verify, "handshake succeeded");
        let _ = self
            .events
            .send(AuthenticationEvent::Success(success.clone()));
        Ok(success)
    }

    async fn fail(&mut self, err: HandshakeError, mut lines: LineChannel) -> Arc<HandshakeError> {
        if self.role == Role::Responder
            && matches!(
                err,
                HandshakeError::MalformedMessage(_) | HandshakeError::InvalidPeerKey(_)
            )
        {
            let _ = lines.write_line(&format!("{PROTOCOL_ERROR} {err}")).await;
        }
        if let Err(err) = lines.close().await {
            debug!(%err, "closing channel failed");
        }

        self.state = HandshakeState::Failed;
        self.key_agreement.wipe();

        warn!(%err, "handshake failed");
        let error = Arc::new(err);
        let _ = self.events.send(AuthenticationEvent::Failure {
            remote: self.remote.clone(),
            error: error.clone(),
            message: error.to_string(),
        });
        error
    }

    async fn delegate(
        &mut self,
        line: String,
        lines: LineChannel,
    ) -> Result<ResponderOutcome, Arc<HandshakeError>> {
        let command = line.split(' ').next().unwrap_or_default().to_string();
        let Some(handler) = self.options.command_handlers.get(&command).cloned() else {
            let err = HandshakeError::MalformedMessage(format!("unknown command '{command}'"));
            return Err(self.fail(err, lines).await);
        };

        debug!(%command, "handing session over to command handler");
        self.key_agreement.wipe();
        if let Err(err) = handler.handle(line, lines).await {
            warn!(%command, %err, "command handler failed");
        }
        Ok(ResponderOutcome::Delegated { command })
    }

    fn transition(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        use HandshakeState::*;

        let valid = matches!(
            (self.state, next),
            (Idle, GreetingSent)
                | (Idle, GreetingReceived)
                | (GreetingSent, KeyExchanged)
                | (GreetingReceived, KeyExchanged)
                | (KeyExchanged, Verifying)
                | (KeyExchanged, Succeeded)
                | (Verifying, Succeeded)
        );
        if !valid {
            return Err(HandshakeError::State(format!(
                "invalid transition from {:?} to {next:?}",
                self.state
            )));
        }

        self.state = next;
        Ok(())
    }

    fn progress(&mut self, message: &str) {
        self.step += 1;
        // Unknown until we learned whether the keys get verified
        let max_steps = match (self.verify, self.verify_known) {
            (true, _) => Some(5),
            (false, true) => Some(4),
            (false, false) => None,
        };
        debug!(step = self.step, ?max_steps, message);
        let _ = self.events.send(AuthenticationEvent::Progress {
            remote: self.remote.clone(),
            step: self.step,
            max_steps,
            message: message.to_string(),
        });
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

/// Starts an initiator session on its own task.
///
/// Progress and the outcome of the session are delivered on the returned receiver.
pub fn start_authentication_with<C: Channel>(
    channel: C,
    options: Arc<HandshakeOptions>,
    param: Option<String>,
) -> EventReceiver {
    let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let _ = Handshake::initiate(channel, options, param, events).await;
    });
    receiver
}

/// `AUTHREQ` or `AUTHACK` line.
#[derive(Debug, PartialEq, Eq)]
struct AuthLine {
    public_key: Vec<u8>,
    verify: bool,
    param: Option<String>,
}

impl AuthLine {
    fn parse(line: &str, command: &str) -> Result<Self, HandshakeError> {
        let malformed = || HandshakeError::MalformedMessage(format!("invalid {command} '{line}'"));

        let rest = line
            .strip_prefix(command)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or_else(malformed)?;
        let (head, param) = match rest.split_once(PARAM_FLAG) {
            Some((head, param)) => (head, Some(param.to_string())),
            None => (rest, None),
        };

        let mut tokens = head.split(' ');
        let public_key = tokens
            .next()
            .and_then(|key| hex::decode(key).ok())
            .ok_or_else(malformed)?;
        let verify = match tokens.next() {
            None => false,
            Some(VERIFY_FLAG) => true,
            Some(_) => return Err(malformed()),
        };
        if tokens.next().is_some() {
            return Err(malformed());
        }

        Ok(Self {
            public_key,
            verify,
            param,
        })
    }
}

fn unexpected_line(line: &str, expected: &str) -> HandshakeError {
    if let Some(reason) = line.strip_prefix(PROTOCOL_ERROR) {
        return HandshakeError::RemoteFailure(reason.trim().to_string());
    }
    if let Some(reason) = line.strip_prefix(VERIFY_FAILED) {
        return HandshakeError::RemoteFailure(reason.trim().to_string());
    }
    HandshakeError::MalformedMessage(format!("expected {expected}, got '{line}'"))
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Channel(ChannelError),

    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid peer public key: {0}")]
    InvalidPeerKey(String),

    #[error("verification failed: {0}")]
    VerificationMismatch(String),

    #[error("remote peer failed: {0}")]
    RemoteFailure(String),

    #[error(transparent)]
    Interlock(InterlockError),

    #[error("invalid handshake state: {0}")]
    State(String),

    #[error(transparent)]
    KeyAgreement(KeyAgreementError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

impl From<ChannelError> for HandshakeError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout(timeout) => HandshakeError::Timeout(timeout),
            ChannelError::LineTooLong => {
                HandshakeError::MalformedMessage("line exceeds the maximum length".into())
            }
            err => HandshakeError::Channel(err),
        }
    }
}

impl From<InterlockError> for HandshakeError {
    fn from(err: InterlockError) -> Self {
        match err {
            InterlockError::Timeout(err) | InterlockError::Channel(err) => err.into(),
            err => HandshakeError::Interlock(err),
        }
    }
}

impl From<KeyAgreementError> for HandshakeError {
    fn from(err: KeyAgreementError) -> Self {
        match err {
            KeyAgreementError::InvalidPeerKey(reason) => HandshakeError::InvalidPeerKey(reason),
            KeyAgreementError::State(reason) => HandshakeError::State(reason.to_string()),
            err => HandshakeError::KeyAgreement(err),
        }
    }
}
