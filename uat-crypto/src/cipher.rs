// SPDX-License-Identifier: MIT OR Apache-2.0

//! AES-256 block cipher with full diffusion across the whole message.
//!
//! A message of exactly one block is encrypted as a single raw AES block. Longer messages are
//! zero-padded to full blocks and encrypted in PCBC (propagating cipher block chaining) mode. The
//! random IV is stored encrypted in front of the chained blocks, masked with a SHA-256 digest over
//! all of them:
//!
//! ```text
//! C_i = E(P_i ^ P_{i-1} ^ C_{i-1}),  P_0 ^ C_0 = IV
//! C_0 = E(IV ^ SHA256(C_1 || .. || C_n)[..16])
//! ```
//!
//! Changing any bit of the ciphertext therefore garbles the recovered IV or one chained block, and
//! PCBC carries the error through every following block. Decryption of a modified ciphertext never
//! returns the original plaintext.
use std::fmt;

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use thiserror::Error;

use crate::rng::{Rng, RngError};
use crate::secret::Secret;
use crate::sha2::sha2_256;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

type Block = [u8; BLOCK_SIZE];

/// Number of ciphertext bytes for a plaintext of the given length.
pub fn ciphertext_len(plaintext_len: usize) -> usize {
    if plaintext_len == BLOCK_SIZE {
        BLOCK_SIZE
    } else {
        (plaintext_len.div_ceil(BLOCK_SIZE) + 1) * BLOCK_SIZE
    }
}

pub struct BlockCipher {
    cipher: Aes256,
}

impl BlockCipher {
    pub fn new(key: &Secret<KEY_SIZE>) -> Self {
        Self {
            cipher: Aes256::new(key.as_bytes().into()),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8], rng: &Rng) -> Result<Vec<u8>, CipherError> {
        if plaintext.is_empty() {
            return Err(CipherError::EmptyMessage);
        }

        if plaintext.len() == BLOCK_SIZE {
            let mut block: Block = plaintext.try_into().expect("checked block size");
            self.encrypt_block(&mut block);
            return Ok(block.to_vec());
        }

        let iv: Block = rng.random_array()?;
        let mut ciphertext = vec![0u8; ciphertext_len(plaintext.len())];
        let mut chain = iv;
        for (index, chunk) in plaintext.chunks(BLOCK_SIZE).enumerate() {
            let mut plain: Block = [0u8; BLOCK_SIZE];
            plain[..chunk.len()].copy_from_slice(chunk);

            let mut block = xor(&plain, &chain);
            self.encrypt_block(&mut block);
            chain = xor(&plain, &block);

            let offset = (index + 1) * BLOCK_SIZE;
            ciphertext[offset..offset + BLOCK_SIZE].copy_from_slice(&block);
        }

        let mut masked_iv = xor(&iv, &digest_mask(&ciphertext[BLOCK_SIZE..]));
        self.encrypt_block(&mut masked_iv);
        ciphertext[..BLOCK_SIZE].copy_from_slice(&masked_iv);
        Ok(ciphertext)
    }

    /// Decrypts a ciphertext back into a plaintext of the given length.
    pub fn decrypt(&self, ciphertext: &[u8], plaintext_len: usize) -> Result<Vec<u8>, CipherError> {
        if plaintext_len == 0 {
            return Err(CipherError::EmptyMessage);
        }

        let expected = ciphertext_len(plaintext_len);
        if ciphertext.len() != expected {
            return Err(CipherError::InvalidLength {
                expected,
                actual: ciphertext.len(),
            });
        }

        if plaintext_len == BLOCK_SIZE {
            let mut block: Block = ciphertext.try_into().expect("checked block size");
            self.decrypt_block(&mut block);
            return Ok(block.to_vec());
        }

        let (masked_iv, blocks) = ciphertext.split_at(BLOCK_SIZE);
        let mut masked_iv: Block = masked_iv.try_into().expect("checked block size");
        self.decrypt_block(&mut masked_iv);
        let mut chain = xor(&masked_iv, &digest_mask(blocks));

        let mut plaintext = Vec::with_capacity(blocks.len());
        for chunk in blocks.chunks(BLOCK_SIZE) {
            let cipher_block: Block = chunk.try_into().expect("checked block size");
            let mut block = cipher_block;
            self.decrypt_block(&mut block);
            let plain = xor(&block, &chain);
            chain = xor(&plain, &cipher_block);
            plaintext.extend_from_slice(&plain);
        }
        plaintext.truncate(plaintext_len);
        Ok(plaintext)
    }

    fn encrypt_block(&self, block: &mut Block) {
        self.cipher.encrypt_block(block.into());
    }

    fn decrypt_block(&self, block: &mut Block) {
        self.cipher.decrypt_block(block.into());
    }
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCipher").finish_non_exhaustive()
    }
}

fn xor(a: &Block, b: &Block) -> Block {
    let mut out = [0u8; BLOCK_SIZE];
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = a[index] ^ b[index];
    }
    out
}

fn digest_mask(blocks: &[u8]) -> Block {
    let digest = sha2_256(&[blocks]);
    digest[..BLOCK_SIZE].try_into().expect("digest longer than block")
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("can not encrypt or decrypt an empty message")]
    EmptyMessage,

    #[error("invalid ciphertext length {actual}, expected {expected} bytes")]
    InvalidLength { expected: usize, actual: usize },

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::rng::Rng;
    use crate::secret::Secret;

    use super::{BLOCK_SIZE, BlockCipher, CipherError, ciphertext_len};

    fn cipher(rng: &Rng) -> BlockCipher {
        BlockCipher::new(&Secret::from_bytes(rng.random_array().unwrap()))
    }

    #[test]
    fn single_block_round_trip() {
        let rng = Rng::from_seed([1; 32]);
        let cipher = cipher(&rng);
        let plaintext = rng.random_vec(BLOCK_SIZE).unwrap();

        let ciphertext = cipher.encrypt(&plaintext, &rng).unwrap();
        assert_eq!(ciphertext.len(), BLOCK_SIZE);
        assert_ne!(ciphertext, plaintext);
        assert_eq!(cipher.decrypt(&ciphertext, BLOCK_SIZE).unwrap(), plaintext);
    }

    #[test]
    fn chained_round_trip() {
        let rng = Rng::from_seed([2; 32]);
        let cipher = cipher(&rng);

        for len in [1, 15, 17, 32, 33, 64, 100] {
            let plaintext = rng.random_vec(len).unwrap();
            let ciphertext = cipher.encrypt(&plaintext, &rng).unwrap();
            assert_eq!(ciphertext.len(), ciphertext_len(len));
            assert_eq!(cipher.decrypt(&ciphertext, len).unwrap(), plaintext);
        }
    }

    #[test]
    fn random_iv_hides_equal_messages() {
        let rng = Rng::from_seed([3; 32]);
        let cipher = cipher(&rng);
        let plaintext = [7u8; 48];

        let first = cipher.encrypt(&plaintext, &rng).unwrap();
        let second = cipher.encrypt(&plaintext, &rng).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampering_garbles_following_blocks() {
        let rng = Rng::from_seed([4; 32]);
        let cipher = cipher(&rng);
        let plaintext = rng.random_vec(64).unwrap();
        let ciphertext = cipher.encrypt(&plaintext, &rng).unwrap();

        for position in [0, BLOCK_SIZE, 2 * BLOCK_SIZE + 3, ciphertext.len() - 1] {
            let mut tampered = ciphertext.clone();
            tampered[position] ^= 0x01;
            let recovered = cipher.decrypt(&tampered, plaintext.len()).unwrap();

            assert_ne!(recovered, plaintext);
            // The last block is always affected, no matter where the bit flipped.
            assert_ne!(recovered[48..], plaintext[48..]);
        }
    }

    #[test]
    fn wrong_key_does_not_decrypt() {
        let rng = Rng::from_seed([5; 32]);
        let plaintext = rng.random_vec(40).unwrap();
        let ciphertext = cipher(&rng).encrypt(&plaintext, &rng).unwrap();

        assert_ne!(cipher(&rng).decrypt(&ciphertext, 40).unwrap(), plaintext);
    }

    #[test]
    fn invalid_lengths() {
        let rng = Rng::from_seed([6; 32]);
        let cipher = cipher(&rng);

        assert_matches!(cipher.encrypt(&[], &rng), Err(CipherError::EmptyMessage));
        assert_matches!(
            cipher.decrypt(&[0; 32], 40),
            Err(CipherError::InvalidLength {
                expected: 64,
                actual: 32
            })
        );
    }
}
