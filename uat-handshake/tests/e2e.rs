// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uat_handshake::channel::{memory_listener, memory_pair};
use uat_handshake::test_utils::{next_outcome, setup_logging, test_options};
use uat_handshake::{
    AuthenticationEvent, Handshake, HandshakeError, HostServer, ResponderOutcome,
    start_authentication_with,
};

#[tokio::test]
async fn loopback_without_secret() {
    setup_logging();

    let (initiator_channel, responder_channel) = memory_pair("initiator", "responder");
    let (events_tx, mut events_rx) = broadcast::channel(64);

    let (initiator, responder) = tokio::join!(
        Handshake::initiate(
            initiator_channel,
            Arc::new(test_options(1, Duration::from_secs(5))),
            None,
            events_tx.clone(),
        ),
        Handshake::accept(
            responder_channel,
            Arc::new(test_options(2, Duration::from_secs(5))),
            events_tx,
        ),
    );

    let initiator = initiator.expect("initiator succeeds");
    let Ok(ResponderOutcome::Authenticated(responder)) = responder else {
        panic!("responder failed");
    };
    assert_eq!(initiator.session_key, responder.session_key);
    assert_eq!(initiator.authentication_key, responder.authentication_key);

    // One success event for each side.
    let mut successes = 0;
    while let Ok(event) = events_rx.try_recv() {
        if let AuthenticationEvent::Success(_) = event {
            successes += 1;
        }
    }
    assert_eq!(successes, 2);
}

#[tokio::test]
async fn tcp_with_matching_secrets() {
    setup_logging();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server_options = test_options(1, Duration::from_secs(5))
        .with_preshared_secrets(vec![b"cafe".to_vec(), b"beef".to_vec()]);
    let mut server = HostServer::new(listener, server_options);
    let mut server_events = server.subscribe();
    server.start().unwrap();

    let client_options =
        test_options(2, Duration::from_secs(5)).with_preshared_secrets(vec![b"cafe".to_vec()]);
    let stream = TcpStream::connect(address).await.unwrap();
    let mut client_events =
        start_authentication_with(stream, Arc::new(client_options), Some("printer".into()));

    let client = next_outcome(&mut client_events).await.expect("client succeeds");
    let server_side = next_outcome(&mut server_events).await.expect("server succeeds");
    assert_eq!(client.session_key, server_side.session_key);
    assert_eq!(server_side.param.as_deref(), Some("printer"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn tcp_with_mismatched_secrets() {
    setup_logging();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server_options =
        test_options(1, Duration::from_secs(5)).with_preshared_secrets(vec![b"cafe".to_vec()]);
    let mut server = HostServer::new(listener, server_options);
    let mut server_events = server.subscribe();
    server.start().unwrap();

    let client_options =
        test_options(2, Duration::from_secs(5)).with_preshared_secrets(vec![b"f00d".to_vec()]);
    let stream = TcpStream::connect(address).await.unwrap();
    let mut client_events = start_authentication_with(stream, Arc::new(client_options), None);

    let client_error = next_outcome(&mut client_events).await.unwrap_err();
    let server_error = next_outcome(&mut server_events).await.unwrap_err();
    assert_matches!(
        client_error.as_ref(),
        HandshakeError::VerificationMismatch(_)
    );
    assert_matches!(
        server_error.as_ref(),
        HandshakeError::VerificationMismatch(_)
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn matching_secret_anywhere_in_candidates() {
    setup_logging();

    let (listener, connector) = memory_listener("server");
    let server_options = test_options(1, Duration::from_secs(5))
        .with_preshared_secrets(vec![b"beef".to_vec(), b"cafe".to_vec()]);
    let mut server = HostServer::new(listener, server_options);
    let mut server_events = server.subscribe();
    server.start().unwrap();

    // Client guesses, the right one comes last
    let client_options = test_options(2, Duration::from_secs(5)).with_preshared_secrets(vec![
        b"f00d".to_vec(),
        b"d00d".to_vec(),
        b"cafe".to_vec(),
    ]);
    let channel = connector.connect("client").await.unwrap();
    let mut client_events = start_authentication_with(channel, Arc::new(client_options), None);

    let client = next_outcome(&mut client_events).await.expect("client succeeds");
    let server_side = next_outcome(&mut server_events).await.expect("server succeeds");
    assert_eq!(client.session_key, server_side.session_key);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn secrets_are_single_use_after_mismatch() {
    setup_logging();

    let (listener, connector) = memory_listener("server");
    let server_options =
        test_options(1, Duration::from_secs(5)).with_preshared_secrets(vec![b"cafe".to_vec()]);
    let mut server = HostServer::new(listener, server_options);
    let mut server_events = server.subscribe();
    server.start().unwrap();

    let attempt = |seed: u8, secret: &[u8]| {
        let options =
            test_options(seed, Duration::from_secs(5)).with_preshared_secrets(vec![secret.to_vec()]);
        let connector = connector.clone();
        async move {
            let channel = connector.connect("client").await.unwrap();
            let mut events = start_authentication_with(channel, Arc::new(options), None);
            next_outcome(&mut events).await
        }
    };

    // Wrong guess
    assert!(attempt(2, b"f00d").await.is_err());
    let error = next_outcome(&mut server_events).await.unwrap_err();
    assert_matches!(error.as_ref(), HandshakeError::VerificationMismatch(_));

    // Someone who learned the secret in the meantime gets nowhere either
    assert!(attempt(3, b"cafe").await.is_err());
    let error = next_outcome(&mut server_events).await.unwrap_err();
    assert_matches!(error.as_ref(), HandshakeError::VerificationMismatch(_));

    // Until a fresh secret was exchanged out-of-band
    server.set_preshared_secrets(vec![b"beef".to_vec()]).await;
    let client = attempt(4, b"beef").await.expect("client succeeds");
    let server_side = next_outcome(&mut server_events).await.expect("server succeeds");
    assert_eq!(client.session_key, server_side.session_key);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_client_times_out_and_server_keeps_accepting() {
    setup_logging();

    let (listener, connector) = memory_listener("server");
    let mut server = HostServer::new(listener, test_options(1, Duration::from_millis(500)));
    let mut server_events = server.subscribe();
    server.start().unwrap();

    // Connect but never say anything.
    let started = Instant::now();
    let _silent = connector.connect("silent").await.unwrap();
    let error = tokio::time::timeout(Duration::from_secs(2), next_outcome(&mut server_events))
        .await
        .expect("responder does not hang")
        .unwrap_err();
    assert_matches!(error.as_ref(), HandshakeError::Timeout(_));
    assert!(started.elapsed() >= Duration::from_millis(450));

    // A well-behaved client is served right after.
    let channel = connector.connect("polite").await.unwrap();
    let mut client_events = start_authentication_with(
        channel,
        Arc::new(test_options(2, Duration::from_secs(2))),
        None,
    );
    let client = next_outcome(&mut client_events).await.expect("client succeeds");
    let server_side = tokio::time::timeout(Duration::from_secs(2), next_outcome(&mut server_events))
        .await
        .unwrap()
        .expect("server succeeds");
    assert_eq!(server_side.remote, "polite");
    assert_eq!(client.session_key, server_side.session_key);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waits_for_running_handshakes() {
    setup_logging();

    let (listener, connector) = memory_listener("server");
    let mut server = HostServer::new(listener, test_options(1, Duration::from_millis(300)));
    let mut server_events = server.subscribe();
    server.start().unwrap();

    let _silent = connector.connect("silent").await.unwrap();
    // Wait until the session started.
    assert_matches!(
        server_events.recv().await.unwrap(),
        AuthenticationEvent::Progress { step: 1, .. }
    );

    server.stop().await.unwrap();
    assert!(!server.is_running());

    // The running session finished before stop returned.
    let error = next_outcome(&mut server_events).await.unwrap_err();
    assert_matches!(error.as_ref(), HandshakeError::Timeout(_));
}
