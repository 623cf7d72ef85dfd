// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host server accepting channels and running a responder handshake for each of them.
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uat_crypto::COMMITMENT_SIZE;

use crate::channel::ChannelListener;
use crate::events::{EventReceiver, EventSender};
use crate::handshake::Handshake;
use crate::options::HandshakeOptions;

/// Capacity of the server's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Accepts channels from a listener and authenticates each of them on its own task.
///
/// Constructing a server has no side effects, the accept loop only runs between
/// [`start`](Self::start) and [`stop`](Self::stop). A failing or panicking handshake never
/// terminates the accept loop.
pub struct HostServer<L: ChannelListener> {
    listener: Option<L>,
    options: Arc<RwLock<Arc<HandshakeOptions>>>,
    events: EventSender,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<L>>,
}

impl<L: ChannelListener> HostServer<L> {
    pub fn new(listener: L, options: HandshakeOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listener: Some(listener),
            options: Arc::new(RwLock::new(Arc::new(options))),
            events,
            cancel_token: CancellationToken::new(),
            task: None,
        }
    }

    /// Subscribes to events of all sessions run by this server.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawns the accept loop and returns immediately.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.task.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let listener = self.listener.take().ok_or(ServerError::AlreadyRunning)?;

        self.cancel_token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.options.clone(),
            self.events.clone(),
            self.cancel_token.clone(),
        ));
        self.task = Some(task);
        info!("host server started");
        Ok(())
    }

    /// Stops accepting channels and waits for all running handshakes to finish.
    ///
    /// The server can be started again afterwards.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let task = self.task.take().ok_or(ServerError::NotRunning)?;
        self.cancel_token.cancel();
        let listener = task.await?;
        self.listener = Some(listener);
        info!("host server stopped");
        Ok(())
    }

    /// Replaces the options for all sessions accepted from now on.
    ///
    /// Running sessions keep the options they started with.
    pub async fn update_options(&self, update: impl FnOnce(HandshakeOptions) -> HandshakeOptions) {
        let mut options = self.options.write().await;
        *options = Arc::new(update(options.as_ref().clone()));
    }

    pub async fn set_preshared_secrets(&self, secrets: Vec<Vec<u8>>) {
        self.update_options(|options| options.with_preshared_secrets(secrets))
            .await;
    }

    /// Commitment to the server's static public key, if one is configured.
    pub async fn permanent_commitment(&self) -> Option<[u8; COMMITMENT_SIZE]> {
        self.options.read().await.permanent_commitment()
    }
}

impl<L: ChannelListener> fmt::Debug for HostServer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServer")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<L: ChannelListener> Drop for HostServer<L> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn accept_loop<L: ChannelListener>(
    mut listener: L,
    options: Arc<RwLock<Arc<HandshakeOptions>>>,
    events: EventSender,
    cancel_token: CancellationToken,
) -> L {
    let mut join_set = JoinSet::new();

    loop {
        tokio::select! {
            // Do not let tokio select futures randomly but with top-to-bottom priority
            biased;
            // Exit loop when shutdown was signalled somewhere else
            _ = cancel_token.cancelled() => {
                break;
            },
            // Handle incoming channels
            result = listener.accept() => {
                match result {
                    Ok(channel) => {
                        // Sessions work on a snapshot of the options taken when they start
                        let options = options.read().await.clone();
                        let events = events.clone();
                        join_set.spawn(async move {
                            let _ = Handshake::accept(channel, options, events).await;
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                        debug!("listener closed: {err}");
                        break;
                    }
                    Err(err) => {
                        warn!("failed accepting channel: {err}");
                    }
                }
            },
            // Handle task terminations
            Some(result) = join_set.join_next(), if !join_set.is_empty() => {
                log_task_result(result);
            },
        }
    }

    // Let running handshakes finish, each of them is bounded by its own timeout
    while let Some(result) = join_set.join_next().await {
        log_task_result(result);
    }

    listener
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            error!("handshake task panicked: {err:?}");
        } else if err.is_cancelled() {
            debug!("handshake task cancelled: {err:?}");
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("host server is already running")]
    AlreadyRunning,

    #[error("host server is not running")]
    NotRunning,

    #[error("accept loop failed: {0}")]
    Task(#[from] JoinError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::time::timeout;

    use crate::channel::memory_listener;
    use crate::handshake::start_authentication_with;
    use crate::options::HandshakeOptions;
    use crate::test_utils::{next_outcome, test_options};

    use super::{HostServer, ServerError};

    fn options(seed: u8) -> HandshakeOptions {
        test_options(seed, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn lifecycle() {
        let (listener, _connector) = memory_listener("server");
        let mut server = HostServer::new(listener, options(1));
        assert!(!server.is_running());
        assert_matches!(server.stop().await, Err(ServerError::NotRunning));

        server.start().unwrap();
        assert!(server.is_running());
        assert_matches!(server.start(), Err(ServerError::AlreadyRunning));

        timeout(Duration::from_secs(1), server.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(!server.is_running());

        // Restart with the same listener.
        server.start().unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn authenticates_incoming_channels() {
        let (listener, connector) = memory_listener("server");
        let mut server = HostServer::new(listener, options(1));
        let mut server_events = server.subscribe();
        server.start().unwrap();

        let channel = connector.connect("client").await.unwrap();
        let mut client_events =
            start_authentication_with(channel, options(2).into(), Some("pairing".into()));

        let client_success = next_outcome(&mut client_events).await.unwrap();
        let server_success = next_outcome(&mut server_events).await.unwrap();

        assert_eq!(server_success.remote, "client");
        assert_eq!(server_success.param.as_deref(), Some("pairing"));
        assert_eq!(client_success.session_key, server_success.session_key);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn update_options_for_new_sessions() {
        let (listener, _connector) = memory_listener("server");
        let server = HostServer::new(listener, options(1));
        assert!(server.permanent_commitment().await.is_none());

        server.set_preshared_secrets(vec![b"1234".to_vec()]).await;
        assert!(server.options.read().await.has_preshared_secrets());
    }
}
