// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use uat_crypto::Secret;

use crate::error::CandidateKeyError;
use crate::events::{CandidateKeyEvent, EventReceiver};
use crate::protocol::KEY_SIZE;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Waits for the outcome concerning the given remote, skipping all other events.
pub async fn next_outcome(
    events: &mut EventReceiver,
    remote: &str,
) -> Result<Secret<KEY_SIZE>, Arc<CandidateKeyError>> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(err) => panic!("event channel failed: {err}"),
        };
        if event.remote() != remote {
            continue;
        }
        match event {
            CandidateKeyEvent::Success { key, .. } => return Ok(key),
            CandidateKeyEvent::Failure { error, .. } => return Err(error),
            CandidateKeyEvent::Progress { .. } => continue,
        }
    }
}

/// Simulated sensor readings: `per_round` distinct parts for each round.
///
/// Parts depend on `device`, except for one part in each of the `shared` rounds which every
/// device observes. Its position within the round differs between devices.
pub fn sensor_rounds(
    device: u8,
    rounds: usize,
    per_round: usize,
    shared: &[usize],
) -> Vec<Vec<Vec<u8>>> {
    assert!(device > 0, "device 0 is reserved for shared readings");
    (0..rounds)
        .map(|round| {
            let mut parts: Vec<Vec<u8>> = (0..per_round)
                .map(|index| reading(device, round, index))
                .collect();
            if shared.contains(&round) {
                let position = (round + device as usize) % per_round;
                parts[position] = reading(0, round, 0);
            }
            parts
        })
        .collect()
}

fn reading(device: u8, round: usize, index: usize) -> Vec<u8> {
    let mut reading = vec![device, round as u8, index as u8];
    reading.extend_from_slice(&[0x5a; 13]);
    reading
}
