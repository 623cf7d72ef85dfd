// SPDX-License-Identifier: MIT OR Apache-2.0

//! SHA2 hashing functions.
use sha2::{Digest, Sha256};

pub const SHA256_DIGEST_SIZE: usize = 32;

/// SHA2-256 hashing function over the concatenation of all messages.
pub fn sha2_256(messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message);
    }
    let result = hasher.finalize();
    result[..].try_into().expect("sha256 digest size")
}

/// SHA2-256 applied twice, `H(H(m))`.
///
/// Candidate key fragments are only ever published as double hashes.
pub fn double_sha2_256(messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let inner = sha2_256(messages);
    sha2_256(&[&inner])
}

#[cfg(test)]
mod tests {
    use super::{double_sha2_256, sha2_256};

    #[test]
    fn concatenation_is_hashed() {
        assert_eq!(sha2_256(&[b"pan", b"da"]), sha2_256(&[b"panda"]));
        assert_ne!(sha2_256(&[b"panda"]), sha2_256(&[b"pandas"]));
    }

    #[test]
    fn double_hash_differs_from_single() {
        let single = sha2_256(&[b"candidate"]);
        let double = double_sha2_256(&[b"candidate"]);
        assert_ne!(single, double);
        assert_eq!(double, sha2_256(&[&single]));
    }
}
