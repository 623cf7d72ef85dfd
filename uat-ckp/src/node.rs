// SPDX-License-Identifier: MIT OR Apache-2.0

//! Node running the candidate key protocol with all remotes on a datagram channel.
//!
//! The application feeds the node one set of candidate parts per round. The node multicasts their
//! identifiers, matches incoming identifiers against its history and, once enough rounds matched
//! for a remote, sends the hash of the assembled key. The remote acknowledges a key it could
//! assemble from its own matches and both report success with that key.
//!
//! When both sides assembled different keys, only the key with the smaller hash gets accepted.
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use crate::config::CandidateKeyConfig;
use crate::datagram::{Datagram, DatagramChannel, DatagramReceiver};
use crate::error::CandidateKeyError;
use crate::events::{CandidateKeyEvent, EVENT_CHANNEL_CAPACITY, EventReceiver, EventSender};
use crate::message::Message;
use crate::protocol::{CandidateHash, CandidateIdentifier, CandidateKey, CandidateKeyProtocol};

/// Number of keys generated for a remote which can still be acknowledged.
const GENERATED_KEYS_SIZE: usize = 5;

/// Local rounds past `max_rounds` a remote gets when it did not run that many rounds itself.
///
/// Covers candidates still in flight. Remotes which went silent, lost datagrams or only listen
/// fail after these.
pub const LATE_ROUNDS: u64 = 2;

/// Candidate key protocol endpoint.
///
/// Constructing a node has no side effects. Incoming datagrams are only handled between
/// [`start`](Self::start) and [`stop`](Self::stop), on a background task which also ends when the
/// node is dropped. Every remote gets exactly one outcome event, after which all further datagrams
/// of that remote are ignored until [`wipe`](Self::wipe) is called.
#[derive(Debug)]
pub struct CandidateKeyNode {
    local_address: String,
    state: Arc<Mutex<NodeState>>,
    events: EventSender,
    incoming: Option<DatagramReceiver>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<DatagramReceiver>>,
}

impl CandidateKeyNode {
    pub fn new(
        channel: impl DatagramChannel,
        incoming: DatagramReceiver,
        config: CandidateKeyConfig,
    ) -> Result<Self, CandidateKeyError> {
        validate(&config)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let local_address = channel.local_address();
        let state = Arc::new(Mutex::new(NodeState {
            protocol: CandidateKeyProtocol::new(
                config.candidate_history_size,
                config.match_history_size,
            ),
            config,
            channel: Box::new(channel),
            sessions: HashMap::new(),
            incoming_candidates: VecDeque::new(),
            finished: HashSet::new(),
            events: events.clone(),
        }));

        Ok(Self {
            local_address,
            state,
            events,
            incoming: Some(incoming),
            cancel_token: CancellationToken::new(),
            task: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawns the task handling incoming datagrams and returns immediately.
    pub fn start(&mut self) -> Result<(), CandidateKeyError> {
        if self.task.is_some() {
            return Err(CandidateKeyError::State("node is already running"));
        }
        let incoming = self
            .incoming
            .take()
            .ok_or(CandidateKeyError::State("node is already running"))?;

        self.cancel_token = CancellationToken::new();
        let span = debug_span!("ckp", local = %self.local_address);
        let task = tokio::spawn(
            receive_loop(self.state.clone(), incoming, self.cancel_token.clone()).instrument(span),
        );
        self.task = Some(task);
        Ok(())
    }

    /// Stops handling incoming datagrams, the node can be started again afterwards.
    ///
    /// Matches and outcomes are kept, datagrams arriving meanwhile are queued by the channel.
    pub async fn stop(&mut self) -> Result<(), CandidateKeyError> {
        let task = self
            .task
            .take()
            .ok_or(CandidateKeyError::State("node is not running"))?;
        self.cancel_token.cancel();
        self.incoming = Some(task.await?);
        Ok(())
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Starts a new round with candidate parts derived from the local sensor readings.
    ///
    /// `entropy` is the estimated entropy in bits of each part. Returns the published identifiers.
    /// Invalid rounds and failing multicasts are reported to the caller, failures concerning a
    /// single remote only show up as events.
    pub async fn add_candidates<P: AsRef<[u8]> + Sync>(
        &self,
        parts: &[P],
        entropy: f32,
    ) -> Result<Vec<CandidateIdentifier>, CandidateKeyError> {
        let span = debug_span!("ckp", local = %self.local_address);
        let mut state = self.state.lock().await;
        state.add_candidates(parts, entropy).instrument(span).await
    }

    /// Number of rounds which matched with the remote so far.
    pub async fn num_matches(&self, remote: &str) -> usize {
        self.state.lock().await.protocol.num_matches(remote)
    }

    /// Forgets all candidates, matches and outcomes.
    pub async fn wipe(&self) {
        let mut state = self.state.lock().await;
        state.protocol.wipe_all();
        state.sessions.clear();
        state.incoming_candidates.clear();
        state.finished.clear();
    }
}

fn validate(config: &CandidateKeyConfig) -> Result<(), CandidateKeyError> {
    if config.candidate_history_size == 0 {
        return Err(CandidateKeyError::InvalidArgument(
            "candidate history can not be empty".into(),
        ));
    }
    if config.min_matching_parts == 0 || config.min_matching_parts > config.match_history_size {
        return Err(CandidateKeyError::InvalidArgument(format!(
            "minimum of {} matching parts needs to fit into a match history of {}",
            config.min_matching_parts, config.match_history_size
        )));
    }
    if !config.min_matching_entropy.is_finite() || config.min_matching_entropy < 0.0 {
        return Err(CandidateKeyError::InvalidArgument(
            "minimum entropy needs to be a non-negative number".into(),
        ));
    }
    Ok(())
}

impl Drop for CandidateKeyNode {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn receive_loop(
    state: Arc<Mutex<NodeState>>,
    mut incoming: DatagramReceiver,
    cancel_token: CancellationToken,
) -> DatagramReceiver {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            datagram = incoming.recv() => {
                let Some(datagram) = datagram else {
                    debug!("datagram channel closed");
                    break;
                };
                let span = debug_span!("datagram", remote = %datagram.remote);
                state
                    .lock()
                    .await
                    .handle_datagram(datagram)
                    .instrument(span)
                    .await;
            }
        }
    }
    incoming
}

#[derive(Debug, Default)]
struct RemoteSession {
    /// Keys we sent to the remote, latest last.
    generated: VecDeque<CandidateKey>,

    /// Keys of the remote we could not reproduce yet.
    pending_keys: VecDeque<(usize, CandidateHash)>,

    /// Rounds the remote multicasted candidates for.
    remote_rounds: BTreeSet<u64>,
}

#[derive(Debug)]
struct NodeState {
    config: CandidateKeyConfig,
    channel: Box<dyn DatagramChannel>,
    protocol: CandidateKeyProtocol,
    sessions: HashMap<String, RemoteSession>,
    incoming_candidates: VecDeque<(String, Vec<CandidateIdentifier>)>,
    finished: HashSet<String>,
    events: EventSender,
}

impl NodeState {
    async fn add_candidates<P: AsRef<[u8]>>(
        &mut self,
        parts: &[P],
        entropy: f32,
    ) -> Result<Vec<CandidateIdentifier>, CandidateKeyError> {
        let identifiers = self.protocol.generate_candidates(parts, entropy)?;
        if self.config.broadcast_candidates {
            let message = Message::candidates(&identifiers)?;
            self.channel.send_multicast(&message.to_bytes()).await?;
        }

        // Candidates received before this round might match now
        for (remote, candidates) in mem::take(&mut self.incoming_candidates) {
            if self.finished.contains(&remote) {
                continue;
            }
            match self.process_candidates(&remote, &candidates).await {
                Ok(true) => (),
                Ok(false) => self.incoming_candidates.push_back((remote, candidates)),
                Err(err) => self.fail(&remote, err, true).await,
            }
        }

        let remotes: Vec<String> = self.sessions.keys().cloned().collect();
        for remote in remotes {
            if let Err(err) = self.check_round_budget(&remote) {
                self.fail(&remote, err, true).await;
            }
        }

        Ok(identifiers)
    }

    async fn handle_datagram(&mut self, datagram: Datagram) {
        let Datagram { remote, payload } = datagram;
        if self.finished.contains(&remote) {
            trace!("ignoring datagram of finished remote");
            return;
        }
        self.sessions.entry(remote.clone()).or_default();
        self.protocol.add_remote(&remote);

        let result = match Message::from_bytes(&payload) {
            Ok(message) => self.handle_message(&remote, message).await,
            Err(err) => Err(err),
        }
        .and_then(|()| self.check_round_budget(&remote));

        if let Err(err) = result {
            let notify = !matches!(err, CandidateKeyError::RemoteAborted);
            self.fail(&remote, err, notify).await;
        }
    }

    async fn handle_message(
        &mut self,
        remote: &str,
        message: Message,
    ) -> Result<(), CandidateKeyError> {
        trace!(%message, "received");
        match &message {
            Message::Candidates { round, .. } => {
                self.handle_candidates(remote, *round, message.identifiers())
                    .await
            }
            Message::Match { round, number } => {
                if self.protocol.acknowledge_match(remote, *round, *number) {
                    self.on_new_match(remote).await?;
                }
                Ok(())
            }
            Message::Key { num_parts, hash } => self.handle_key(remote, *num_parts, *hash).await,
            Message::Ack { hash } => self.handle_ack(remote, hash),
            Message::Nack => Err(CandidateKeyError::RemoteAborted),
        }
    }

    async fn handle_candidates(
        &mut self,
        remote: &str,
        round: u64,
        candidates: Vec<CandidateIdentifier>,
    ) -> Result<(), CandidateKeyError> {
        self.sessions
            .entry(remote.to_string())
            .or_default()
            .remote_rounds
            .insert(round);

        if !self.process_candidates(remote, &candidates).await? {
            trace!(round, "no match, buffering candidates");
            self.incoming_candidates
                .push_back((remote.to_string(), candidates));
            if self.incoming_candidates.len() > self.config.incoming_buffer_size {
                self.incoming_candidates.pop_front();
            }
        }
        Ok(())
    }

    /// Returns true when one of the candidates matched.
    async fn process_candidates(
        &mut self,
        remote: &str,
        candidates: &[CandidateIdentifier],
    ) -> Result<bool, CandidateKeyError> {
        let Some(index) = self.protocol.match_candidates(remote, candidates)? else {
            return Ok(false);
        };

        if self.config.send_matches {
            let message = Message::Match {
                round: candidates[index].round,
                number: candidates[index].number,
            };
            self.channel.send_to(remote, &message.to_bytes()).await?;
        }

        self.on_new_match(remote).await?;
        Ok(true)
    }

    async fn on_new_match(&mut self, remote: &str) -> Result<(), CandidateKeyError> {
        let matches = self.protocol.num_matches(remote);
        debug!(matches, "candidate matched");
        self.emit(CandidateKeyEvent::Progress {
            remote: remote.to_string(),
            matches,
            required: self.config.min_matching_parts,
        });

        self.check_key_generation(remote).await?;
        self.retry_pending_keys(remote).await
    }

    fn quota_met(&self, remote: &str) -> bool {
        self.protocol.num_matches(remote) >= self.config.min_matching_parts
            && self.protocol.sum_match_entropy(remote) >= self.config.min_matching_entropy
    }

    async fn check_key_generation(&mut self, remote: &str) -> Result<(), CandidateKeyError> {
        if !self.quota_met(remote) {
            return Ok(());
        }

        let key = self.protocol.generate_key(remote)?;
        let session = self.sessions.entry(remote.to_string()).or_default();
        if session
            .generated
            .iter()
            .any(|generated| generated.hash == key.hash)
        {
            return Ok(());
        }

        debug!(
            parts = key.num_parts,
            hash = %hex::encode(key.hash),
            "sending candidate key"
        );
        let message = Message::Key {
            num_parts: key.num_parts,
            hash: key.hash,
        };
        session.generated.push_back(key);
        if session.generated.len() > GENERATED_KEYS_SIZE {
            session.generated.pop_front();
        }

        self.channel.send_to(remote, &message.to_bytes()).await?;
        Ok(())
    }

    async fn handle_key(
        &mut self,
        remote: &str,
        num_parts: usize,
        hash: CandidateHash,
    ) -> Result<(), CandidateKeyError> {
        if let Some(key) = self.try_adopt(remote, num_parts, &hash) {
            self.channel
                .send_to(remote, &Message::Ack { hash }.to_bytes())
                .await?;
            self.succeed(remote, key);
            return Ok(());
        }

        trace!(num_parts, "buffering candidate key of remote");
        let limit = self.config.incoming_buffer_size;
        let session = self.sessions.entry(remote.to_string()).or_default();
        if !session.pending_keys.contains(&(num_parts, hash)) {
            session.pending_keys.push_back((num_parts, hash));
            if session.pending_keys.len() > limit {
                session.pending_keys.pop_front();
            }
        }
        Ok(())
    }

    /// Finds the key of the remote among our own matches, if we are ready to accept it.
    fn try_adopt(
        &self,
        remote: &str,
        num_parts: usize,
        hash: &CandidateHash,
    ) -> Option<CandidateKey> {
        if !self.quota_met(remote) {
            return None;
        }

        let generated = self.sessions.get(remote).map(|session| &session.generated);
        if let Some(key) = generated.and_then(|keys| keys.iter().find(|key| key.hash == *hash)) {
            return Some(key.clone());
        }

        // Wait for the remote to accept our key instead
        if generated
            .and_then(|keys| keys.back())
            .is_some_and(|own| *hash > own.hash)
        {
            return None;
        }

        self.protocol.search_key(remote, hash, num_parts)
    }

    async fn retry_pending_keys(&mut self, remote: &str) -> Result<(), CandidateKeyError> {
        let pending = match self.sessions.get_mut(remote) {
            Some(session) => mem::take(&mut session.pending_keys),
            None => return Ok(()),
        };

        for (num_parts, hash) in pending {
            if self.finished.contains(remote) {
                break;
            }
            self.handle_key(remote, num_parts, hash).await?;
        }
        Ok(())
    }

    fn handle_ack(&mut self, remote: &str, hash: &CandidateHash) -> Result<(), CandidateKeyError> {
        let key = self.sessions.get(remote).and_then(|session| {
            session
                .generated
                .iter()
                .find(|key| key.hash == *hash)
                .cloned()
        });

        match key {
            Some(key) => {
                self.succeed(remote, key);
                Ok(())
            }
            None => Err(CandidateKeyError::UnknownKey),
        }
    }

    fn check_round_budget(&self, remote: &str) -> Result<(), CandidateKeyError> {
        if self.finished.contains(remote) || self.quota_met(remote) {
            return Ok(());
        }

        // Late candidates of the remote could still match until it ran out of rounds as well
        let max_rounds = self.config.max_rounds as u64;
        let local_rounds = self.protocol.num_local_rounds(remote);
        let remote_rounds = self
            .sessions
            .get(remote)
            .map_or(0, |session| session.remote_rounds.len()) as u64;

        if local_rounds >= max_rounds
            && (remote_rounds >= max_rounds || local_rounds >= max_rounds + LATE_ROUNDS)
        {
            return Err(CandidateKeyError::NoMatch(format!(
                "{} of {} required rounds matched after {local_rounds} rounds",
                self.protocol.num_matches(remote),
                self.config.min_matching_parts
            )));
        }
        Ok(())
    }

    fn succeed(&mut self, remote: &str, key: CandidateKey) {
        if !self.finished.insert(remote.to_string()) {
            return;
        }
        info!(remote, parts = key.num_parts, "agreed on candidate key");
        self.forget(remote);
        self.emit(CandidateKeyEvent::Success {
            remote: remote.to_string(),
            key: key.key,
        });
    }

    async fn fail(&mut self, remote: &str, error: CandidateKeyError, notify: bool) {
        if !self.finished.insert(remote.to_string()) {
            return;
        }
        warn!(remote, "candidate key protocol failed: {error}");

        if notify {
            if let Err(err) = self
                .channel
                .send_to(remote, &Message::Nack.to_bytes())
                .await
            {
                debug!("failed sending NACK: {err}");
            }
        }

        self.forget(remote);
        self.emit(CandidateKeyEvent::Failure {
            remote: remote.to_string(),
            error: Arc::new(error),
        });
    }

    fn forget(&mut self, remote: &str) {
        self.protocol.wipe(remote);
        self.sessions.remove(remote);
        self.incoming_candidates
            .retain(|(candidates_remote, _)| candidates_remote != remote);
    }

    fn emit(&self, event: CandidateKeyEvent) {
        // Nobody might be listening
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uat_crypto::sha2::double_sha2_256;

    use crate::config::CandidateKeyConfig;
    use crate::datagram::{DatagramChannel, DatagramHub, DatagramReceiver, HubChannel};
    use crate::error::CandidateKeyError;
    use crate::events::CandidateKeyEvent;
    use crate::message::Message;
    use crate::test_utils::next_outcome;

    use super::{CandidateKeyNode, LATE_ROUNDS};

    #[derive(Debug)]
    struct Unconnected;

    #[async_trait]
    impl DatagramChannel for Unconnected {
        fn local_address(&self) -> String {
            "nowhere".into()
        }

        async fn send_multicast(&self, _payload: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn send_to(&self, _remote: &str, _payload: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    fn config() -> CandidateKeyConfig {
        CandidateKeyConfig {
            min_matching_parts: 2,
            min_matching_entropy: 8.0,
            max_rounds: 4,
            send_matches: true,
            ..CandidateKeyConfig::default()
        }
    }

    async fn node_and_peer(hub: &DatagramHub) -> (CandidateKeyNode, HubChannel, DatagramReceiver) {
        let (channel, incoming) = hub.join("alice").await;
        let mut node = CandidateKeyNode::new(channel, incoming, config()).unwrap();
        node.start().unwrap();
        let (peer, peer_rx) = hub.join("mallory").await;
        (node, peer, peer_rx)
    }

    /// Rounds after which a remote which does not run rounds itself fails.
    fn budget_with_late_rounds() -> u8 {
        (config().max_rounds as u64 + LATE_ROUNDS) as u8
    }

    #[test]
    fn construction_spawns_nothing() {
        // Outside of a runtime any spawned task would panic
        let (_tx, incoming) = mpsc::channel(1);
        let node = CandidateKeyNode::new(Unconnected, incoming, config()).unwrap();
        assert!(!node.is_running());
        assert_eq!(node.local_address(), "nowhere");
    }

    #[tokio::test]
    async fn handles_datagrams_between_start_and_stop() {
        let hub = DatagramHub::new();
        let (channel, incoming) = hub.join("alice").await;
        let mut node = CandidateKeyNode::new(channel, incoming, config()).unwrap();
        let mut events = node.subscribe();
        let (peer, _peer_rx) = hub.join("mallory").await;

        peer.send_to("alice", b"NACK").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_matches!(node.stop().await, Err(CandidateKeyError::State(_)));

        node.start().unwrap();
        assert!(node.is_running());
        assert_matches!(node.start(), Err(CandidateKeyError::State(_)));

        // The queued datagram gets handled now
        let error = next_outcome(&mut events, "mallory").await.unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::RemoteAborted);

        node.stop().await.unwrap();
        assert!(!node.is_running());
        node.start().unwrap();
        node.stop().await.unwrap();
    }

    async fn receive(rx: &mut DatagramReceiver) -> Message {
        let datagram = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        Message::from_bytes(&datagram.payload).unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let hub = DatagramHub::new();
        let (channel, incoming) = hub.join("alice").await;
        let config = CandidateKeyConfig {
            min_matching_parts: 100,
            match_history_size: 10,
            ..CandidateKeyConfig::default()
        };
        assert_matches!(
            CandidateKeyNode::new(channel, incoming, config),
            Err(CandidateKeyError::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn invalid_rounds_are_reported_to_caller() {
        let hub = DatagramHub::new();
        let (node, _peer, _peer_rx) = node_and_peer(&hub).await;
        let empty: [Vec<u8>; 0] = [];
        assert_matches!(
            node.add_candidates(&empty, 8.0).await,
            Err(CandidateKeyError::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn reports_matches_back() {
        let hub = DatagramHub::new();
        let (node, peer, mut peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        let identifiers = node.add_candidates(&[b"one", b"two"], 8.0).await.unwrap();
        assert_eq!(
            receive(&mut peer_rx).await,
            Message::candidates(&identifiers).unwrap()
        );

        // Mallory claims to have seen the second part in its round 7
        let message = Message::Candidates {
            round: 7,
            hashes: vec![[0; 32], double_sha2_256(&[b"two"])],
        };
        peer.send_multicast(&message.to_bytes()).await.unwrap();

        assert_eq!(
            receive(&mut peer_rx).await,
            Message::Match {
                round: 7,
                number: 1
            }
        );
        assert_matches!(
            events.recv().await.unwrap(),
            CandidateKeyEvent::Progress {
                matches: 1,
                required: 2,
                ..
            }
        );
        assert_eq!(node.num_matches("mallory").await, 1);
    }

    #[tokio::test]
    async fn malformed_datagram_fails_remote() {
        let hub = DatagramHub::new();
        let (node, peer, mut peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        peer.send_to("alice", b"CAND seven").await.unwrap();
        let error = next_outcome(&mut events, "mallory").await.unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::MalformedCandidate(_));
        assert_eq!(receive(&mut peer_rx).await, Message::Nack);

        // Further datagrams of the remote are ignored
        peer.send_to("alice", b"NACK").await.unwrap();
        node.add_candidates(&[b"one"], 8.0).await.unwrap();
        assert_matches!(receive(&mut peer_rx).await, Message::Candidates { .. });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_acknowledgement_fails_remote() {
        let hub = DatagramHub::new();
        let (node, peer, mut peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        let message = Message::Ack { hash: [7; 32] };
        peer.send_to("alice", &message.to_bytes()).await.unwrap();
        let error = next_outcome(&mut events, "mallory").await.unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::UnknownKey);
        assert_eq!(receive(&mut peer_rx).await, Message::Nack);
    }

    #[tokio::test]
    async fn remote_abort_is_not_answered() {
        let hub = DatagramHub::new();
        let (node, peer, mut peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        peer.send_to("alice", b"NACK").await.unwrap();
        let error = next_outcome(&mut events, "mallory").await.unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::RemoteAborted);
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn gives_up_after_round_budget() {
        let hub = DatagramHub::new();
        let (node, peer, mut peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        for round in 1..=4u8 {
            node.add_candidates(&[[round; 8]], 8.0).await.unwrap();
            let message = Message::Candidates {
                round: round as u64,
                hashes: vec![[round; 32]],
            };
            peer.send_multicast(&message.to_bytes()).await.unwrap();
        }

        let error = next_outcome(&mut events, "mallory").await.unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::NoMatch(_));

        // Four rounds of candidates, then the NACK
        for _ in 0..4 {
            assert_matches!(receive(&mut peer_rx).await, Message::Candidates { .. });
        }
        assert_eq!(receive(&mut peer_rx).await, Message::Nack);
        assert_eq!(peer.local_address(), "mallory");
    }

    #[tokio::test]
    async fn silent_remote_fails_after_late_rounds() {
        let hub = DatagramHub::new();
        let (node, peer, _peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        // One round of candidates, then nothing
        let message = Message::Candidates {
            round: 1,
            hashes: vec![[1; 32]],
        };
        peer.send_multicast(&message.to_bytes()).await.unwrap();

        for round in 1..=budget_with_late_rounds() {
            node.add_candidates(&[[round; 8]], 8.0).await.unwrap();
        }

        let error = timeout(Duration::from_secs(2), next_outcome(&mut events, "mallory"))
            .await
            .unwrap()
            .unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::NoMatch(_));
    }

    #[tokio::test]
    async fn listening_remote_fails_after_late_rounds() {
        let hub = DatagramHub::new();
        let (node, peer, _peer_rx) = node_and_peer(&hub).await;
        let mut events = node.subscribe();

        // Mallory never multicasts candidates and reports a single match
        let identifiers = node.add_candidates(&[b"one"], 8.0).await.unwrap();
        let message = Message::Match {
            round: identifiers[0].round,
            number: identifiers[0].number,
        };
        peer.send_to("alice", &message.to_bytes()).await.unwrap();

        for round in 2..=budget_with_late_rounds() {
            node.add_candidates(&[[round; 8]], 8.0).await.unwrap();
        }

        let error = timeout(Duration::from_secs(2), next_outcome(&mut events, "mallory"))
            .await
            .unwrap()
            .unwrap_err();
        assert_matches!(error.as_ref(), CandidateKeyError::NoMatch(_));
        assert_eq!(node.num_matches("mallory").await, 0);
    }
}
