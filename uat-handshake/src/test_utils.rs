// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::Receiver;
use uat_crypto::Rng;

use crate::config::HandshakeConfig;
use crate::events::{AuthenticationEvent, AuthenticationSuccess};
use crate::handshake::HandshakeError;
use crate::options::HandshakeOptions;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Options with deterministic randomness and the given read timeout.
pub fn test_options(seed: u8, timeout: Duration) -> HandshakeOptions {
    HandshakeOptions::new(HandshakeConfig {
        timeout,
        ..HandshakeConfig::default()
    })
    .with_rng(Rng::from_seed([seed; 32]))
}

/// Waits for the next outcome event, skipping progress events.
pub async fn next_outcome(
    events: &mut Receiver<AuthenticationEvent>,
) -> Result<AuthenticationSuccess, Arc<HandshakeError>> {
    loop {
        match events.recv().await {
            Ok(AuthenticationEvent::Success(success)) => return Ok(success),
            Ok(AuthenticationEvent::Failure { error, .. }) => return Err(error),
            Ok(AuthenticationEvent::Progress { .. }) => continue,
            Err(err) => panic!("event channel failed: {err}"),
        }
    }
}
