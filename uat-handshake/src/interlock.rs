// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interlock protocol to exchange encrypted messages without letting either side adapt its
//! message after seeing the other one.
//!
//! Each side encrypts its message with the shared key and splits the ciphertext into a number of
//! rounds. Parts are sent in lockstep: the part of round `k + 1` is only sent after the peer's
//! part of round `k` arrived. Every part carries a slice of bits from every cipher block, so no
//! complete block can be decrypted before the last round. An attacker sitting in the middle has to
//! commit to a forwarded message before it learns anything about the original one.
//!
//! On the wire the exchange looks like this, both sides sending the same lines:
//!
//! ```text
//! ILCKINIT <byteLength>
//! ILCKRND 0 <hexPart>
//! ILCKRND 1 <hexPart>
//! ...
//! ```
//!
//! Depending on the number of rounds the last parts might not carry any bits, these are sent as
//! `ILCKRND <round>` without a payload.
use std::ops::Range;

use thiserror::Error;
use tracing::{debug, trace};
use uat_crypto::cipher::{KEY_SIZE, ciphertext_len};
use uat_crypto::{BLOCK_SIZE, BlockCipher, CipherError, Rng, Secret};

use crate::channel::{ChannelError, LineChannel};
use crate::config::HandshakeConfig;

pub const INIT_COMMAND: &str = "ILCKINIT";

pub const ROUND_COMMAND: &str = "ILCKRND";

const BLOCK_BITS: usize = BLOCK_SIZE * 8;

/// State of one interlock run bound to a key, round count and message length.
#[derive(Debug)]
pub struct Interlock {
    cipher: BlockCipher,
    rounds: usize,
    message_len: usize,
    num_blocks: usize,
    bits_per_round: usize,
    received: Vec<Option<Vec<u8>>>,
}

impl Interlock {
    pub fn new(
        key: &Secret<KEY_SIZE>,
        rounds: usize,
        message_len: usize,
    ) -> Result<Self, InterlockError> {
        if !(2..=BLOCK_BITS).contains(&rounds) {
            return Err(InterlockError::InvalidArgument(format!(
                "number of rounds needs to be between 2 and {BLOCK_BITS}, got {rounds}"
            )));
        }

        if message_len < BLOCK_SIZE {
            return Err(InterlockError::InvalidArgument(format!(
                "message needs to be at least {BLOCK_SIZE} bytes long, got {message_len}"
            )));
        }

        Ok(Self {
            cipher: BlockCipher::new(key),
            rounds,
            message_len,
            num_blocks: ciphertext_len(message_len) / BLOCK_SIZE,
            bits_per_round: BLOCK_BITS.div_ceil(rounds),
            received: vec![None; rounds],
        })
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn message_len(&self) -> usize {
        self.message_len
    }

    /// Length of the ciphertext in bytes.
    pub fn ciphertext_len(&self) -> usize {
        self.num_blocks * BLOCK_SIZE
    }

    /// Length of the part sent in the given round in bytes.
    pub fn part_len(&self, round: usize) -> usize {
        (self.bit_range(round).len() * self.num_blocks).div_ceil(8)
    }

    pub fn encrypt(&self, plaintext: &[u8], rng: &Rng) -> Result<Vec<u8>, InterlockError> {
        if plaintext.len() != self.message_len {
            return Err(InterlockError::InvalidArgument(format!(
                "expected message of {} bytes, got {}",
                self.message_len,
                plaintext.len()
            )));
        }
        Ok(self.cipher.encrypt(plaintext, rng)?)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, InterlockError> {
        Ok(self.cipher.decrypt(ciphertext, self.message_len)?)
    }

    /// Splits a ciphertext into one part per round.
    pub fn split(&self, ciphertext: &[u8]) -> Result<Vec<Vec<u8>>, InterlockError> {
        if ciphertext.len() != self.ciphertext_len() {
            return Err(InterlockError::InvalidArgument(format!(
                "expected ciphertext of {} bytes, got {}",
                self.ciphertext_len(),
                ciphertext.len()
            )));
        }

        let parts = (0..self.rounds)
            .map(|round| {
                let range = self.bit_range(round);
                let mut part = vec![0u8; self.part_len(round)];
                let mut target = 0;
                for block in ciphertext.chunks(BLOCK_SIZE) {
                    for bit in range.clone() {
                        if get_bit(block, bit) {
                            set_bit(&mut part, target);
                        }
                        target += 1;
                    }
                }
                part
            })
            .collect();
        Ok(parts)
    }

    /// Stores the peer's part of a round.
    ///
    /// Returns `false` if a part for this round was already added, the duplicate is ignored.
    pub fn add_part(&mut self, round: usize, part: &[u8]) -> Result<bool, InterlockError> {
        if round >= self.rounds {
            return Err(InterlockError::Protocol(format!(
                "round {round} out of range, expected less than {}",
                self.rounds
            )));
        }

        if part.len() != self.part_len(round) {
            return Err(InterlockError::Protocol(format!(
                "part of round {round} has {} bytes, expected {}",
                part.len(),
                self.part_len(round)
            )));
        }

        if self.received[round].is_some() {
            trace!(round, "ignore duplicate interlock part");
            return Ok(false);
        }

        self.received[round] = Some(part.to_vec());
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(Option::is_some)
    }

    /// Reassembles the peer's ciphertext from all received parts.
    pub fn reassemble(&self) -> Result<Vec<u8>, InterlockError> {
        let mut ciphertext = vec![0u8; self.ciphertext_len()];
        for (round, part) in self.received.iter().enumerate() {
            let part = part
                .as_ref()
                .ok_or_else(|| InterlockError::Protocol(format!("part of round {round} missing")))?;
            let range = self.bit_range(round);
            let mut source = 0;
            for block in ciphertext.chunks_mut(BLOCK_SIZE) {
                for bit in range.clone() {
                    if get_bit(part, source) {
                        set_bit(block, bit);
                    }
                    source += 1;
                }
            }
        }
        Ok(ciphertext)
    }

    /// Bits of every cipher block which are carried by the given round.
    fn bit_range(&self, round: usize) -> Range<usize> {
        let start = (round * self.bits_per_round).min(BLOCK_BITS);
        let end = ((round + 1) * self.bits_per_round).min(BLOCK_BITS);
        start..end
    }
}

fn get_bit(bytes: &[u8], index: usize) -> bool {
    bytes[index / 8] & (1 << (index % 8)) != 0
}

fn set_bit(bytes: &mut [u8], index: usize) {
    bytes[index / 8] |= 1 << (index % 8);
}

/// Runs a full interlock exchange over the channel and returns the peer's decrypted message.
///
/// Both sides need to exchange messages of equal length.
pub async fn exchange(
    channel: &mut LineChannel,
    key: &Secret<KEY_SIZE>,
    plaintext: &[u8],
    config: &HandshakeConfig,
    rng: &Rng,
) -> Result<Vec<u8>, InterlockError> {
    if plaintext.len() > config.max_interlock_message_len {
        return Err(InterlockError::InvalidArgument(format!(
            "message of {} bytes exceeds maximum of {}",
            plaintext.len(),
            config.max_interlock_message_len
        )));
    }

    channel
        .write_line(&format!("{INIT_COMMAND} {}", plaintext.len()))
        .await?;
    let remote_len = parse_init(&channel.read_line().await?, config.max_interlock_message_len)?;
    if remote_len != plaintext.len() {
        return Err(InterlockError::Protocol(format!(
            "message length mismatch, local {} remote {remote_len}",
            plaintext.len()
        )));
    }

    let mut interlock = Interlock::new(key, config.interlock_rounds, plaintext.len())?;
    let ciphertext = interlock.encrypt(plaintext, rng)?;
    let parts = interlock.split(&ciphertext)?;

    for (round, part) in parts.iter().enumerate() {
        if part.is_empty() {
            channel.write_line(&format!("{ROUND_COMMAND} {round}")).await?;
        } else {
            channel
                .write_line(&format!("{ROUND_COMMAND} {round} {}", hex::encode(part)))
                .await?;
        }

        let (remote_round, remote_part) = parse_round(&channel.read_line().await?)?;
        if remote_round != round {
            return Err(InterlockError::Protocol(format!(
                "expected round {round}, got {remote_round}"
            )));
        }
        interlock.add_part(round, &remote_part)?;
        trace!(round, "interlock round completed");
    }

    let remote_ciphertext = interlock.reassemble()?;
    if config.mirror_attack_protection
        && remote_ciphertext.len() > BLOCK_SIZE
        && remote_ciphertext[..BLOCK_SIZE] == ciphertext[..BLOCK_SIZE]
    {
        return Err(InterlockError::Protocol(
            "remote message reflects our own, possible mirror attack".into(),
        ));
    }

    debug!(
        remote = %channel.remote_address(),
        rounds = interlock.rounds(),
        "interlock exchange completed"
    );
    interlock.decrypt(&remote_ciphertext)
}

fn parse_init(line: &str, max_len: usize) -> Result<usize, InterlockError> {
    let len = line
        .strip_prefix(INIT_COMMAND)
        .and_then(|rest| rest.strip_prefix(' '))
        .and_then(|len| len.parse::<usize>().ok())
        .ok_or_else(|| InterlockError::Protocol(format!("expected {INIT_COMMAND}, got '{line}'")))?;
    if len > max_len {
        return Err(InterlockError::Protocol(format!(
            "announced message length {len} exceeds maximum of {max_len}"
        )));
    }
    Ok(len)
}

fn parse_round(line: &str) -> Result<(usize, Vec<u8>), InterlockError> {
    let malformed = || InterlockError::Protocol(format!("expected {ROUND_COMMAND}, got '{line}'"));
    let mut tokens = line.split(' ');
    if tokens.next() != Some(ROUND_COMMAND) {
        return Err(malformed());
    }
    let round = tokens
        .next()
        .and_then(|round| round.parse::<usize>().ok())
        .ok_or_else(malformed)?;
    let part = match tokens.next() {
        Some(part) => hex::decode(part).map_err(|_| malformed())?,
        None => Vec::new(),
    };
    if tokens.next().is_some() {
        return Err(malformed());
    }
    Ok((round, part))
}

#[derive(Debug, Error)]
pub enum InterlockError {
    #[error("interlock protocol violation: {0}")]
    Protocol(String),

    #[error("interlock timed out: {0}")]
    Timeout(ChannelError),

    #[error(transparent)]
    Channel(ChannelError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("invalid interlock argument: {0}")]
    InvalidArgument(String),
}

impl From<ChannelError> for InterlockError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout(_) => InterlockError::Timeout(err),
            err => InterlockError::Channel(err),
        }
    }
}
